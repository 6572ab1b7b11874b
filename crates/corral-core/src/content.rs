use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::MessageId;
use crate::messages::WireBlock;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// Finalized content block as the engine stores and broadcasts it.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Thinking {
        thinking: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        tool_name: Option<String>,
        content: String,
        is_error: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        parsed: Option<ParsedToolResult>,
    },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Text { .. } => "text",
            Self::Thinking { .. } => "thinking",
            Self::ToolUse { .. } => "tool_use",
            Self::ToolResult { .. } => "tool_result",
        }
    }

    /// Convert a wire block. `tool_name` resolves the originating tool of a
    /// tool_result so it can be parsed; unknown wire kinds yield `None`.
    pub fn from_wire(
        block: &WireBlock,
        tool_name: impl Fn(&str) -> Option<String>,
        structured: Option<&Value>,
    ) -> Option<Self> {
        match block {
            WireBlock::Text { text } => Some(Self::Text { text: text.clone() }),
            WireBlock::Thinking { thinking, signature } => Some(Self::Thinking {
                thinking: thinking.clone(),
                signature: signature.clone(),
            }),
            WireBlock::ToolUse { id, name, input } => Some(Self::ToolUse {
                id: id.clone(),
                name: name.clone(),
                input: input.clone(),
            }),
            WireBlock::ToolResult { tool_use_id, content, is_error } => {
                let name = tool_name(tool_use_id);
                let is_error = is_error.unwrap_or(false);
                let text = tool_result_text(content);
                let parsed = if is_error {
                    None
                } else {
                    name.as_deref().map(|n| ParsedToolResult::parse(n, &text, structured))
                };
                Some(Self::ToolResult {
                    tool_use_id: tool_use_id.clone(),
                    tool_name: name,
                    content: text,
                    is_error,
                    parsed,
                })
            }
            WireBlock::Unknown => None,
        }
    }
}

/// Flatten a tool_result payload (plain string or list of text parts).
pub fn tool_result_text(content: &Value) -> String {
    match content {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|p| match p {
                Value::String(s) => Some(s.as_str()),
                other => other.get("text").and_then(Value::as_str),
            })
            .collect::<Vec<_>>()
            .join("\n"),
        other => other.to_string(),
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: MessageId,
    pub role: Role,
    pub content: Vec<ContentBlock>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_tool_use_id: Option<String>,
}

impl Message {
    pub fn new(role: Role, content: Vec<ContentBlock>) -> Self {
        Self {
            id: MessageId::new(),
            role,
            content,
            created_at: Utc::now(),
            parent_tool_use_id: None,
        }
    }

    pub fn user_text(text: impl Into<String>) -> Self {
        Self::new(Role::User, vec![ContentBlock::text(text)])
    }

    pub fn assistant(content: Vec<ContentBlock>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn tool_uses(&self) -> impl Iterator<Item = (&str, &str, &Value)> {
        self.content.iter().filter_map(|b| match b {
            ContentBlock::ToolUse { id, name, input } => Some((id.as_str(), name.as_str(), input)),
            _ => None,
        })
    }

    /// Concatenated text blocks.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }
}

// --- Typed tool results ---

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParsedToolResult {
    Bash {
        stdout: String,
        stderr: String,
        interrupted: bool,
    },
    FileRead {
        file_path: Option<String>,
        content: String,
        num_lines: usize,
        start_line: usize,
    },
    FileWrite {
        file_path: Option<String>,
        operation: FileOperation,
    },
    Todo {
        todos: Vec<TodoItem>,
    },
    Generic {
        text: String,
    },
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FileOperation {
    Created,
    Updated,
    Edited,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TodoItem {
    pub content: String,
    pub status: String,
    #[serde(default, rename = "activeForm", skip_serializing_if = "Option::is_none")]
    pub active_form: Option<String>,
}

impl ParsedToolResult {
    /// Parse a successful tool result by tool name. `structured` is the
    /// optional machine-readable result the agent attaches beside the text.
    pub fn parse(tool_name: &str, text: &str, structured: Option<&Value>) -> Self {
        let s = structured.filter(|v| v.is_object());
        match tool_name {
            "Bash" => match s {
                Some(v) => Self::Bash {
                    stdout: str_field(v, "stdout").unwrap_or_default(),
                    stderr: str_field(v, "stderr").unwrap_or_default(),
                    interrupted: v.get("interrupted").and_then(Value::as_bool).unwrap_or(false),
                },
                None => Self::Bash {
                    stdout: text.to_owned(),
                    stderr: String::new(),
                    interrupted: false,
                },
            },
            "Read" => {
                let file = s.and_then(|v| v.get("file"));
                match file {
                    Some(f) => {
                        let content = str_field(f, "content").unwrap_or_default();
                        Self::FileRead {
                            file_path: str_field(f, "filePath"),
                            num_lines: usize_field(f, "numLines").unwrap_or_else(|| content.lines().count()),
                            start_line: usize_field(f, "startLine").unwrap_or(1),
                            content,
                        }
                    }
                    None => Self::FileRead {
                        file_path: None,
                        content: text.to_owned(),
                        num_lines: text.lines().count(),
                        start_line: 1,
                    },
                }
            }
            "Write" => Self::FileWrite {
                file_path: s.and_then(|v| str_field(v, "filePath")),
                operation: match s.and_then(|v| v.get("type")).and_then(Value::as_str) {
                    Some("update") => FileOperation::Updated,
                    _ => FileOperation::Created,
                },
            },
            "Edit" | "MultiEdit" => Self::FileWrite {
                file_path: s.and_then(|v| str_field(v, "filePath")),
                operation: FileOperation::Edited,
            },
            "TodoWrite" => {
                let todos = s
                    .and_then(|v| v.get("newTodos"))
                    .and_then(|t| serde_json::from_value::<Vec<TodoItem>>(t.clone()).ok())
                    .unwrap_or_default();
                Self::Todo { todos }
            }
            _ => Self::Generic { text: text.to_owned() },
        }
    }
}

fn str_field(v: &Value, key: &str) -> Option<String> {
    v.get(key).and_then(Value::as_str).map(str::to_owned)
}

fn usize_field(v: &Value, key: &str) -> Option<usize> {
    v.get(key).and_then(Value::as_u64).map(|n| n as usize)
}
