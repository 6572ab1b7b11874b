//! Mapping between the task/message/status-update dialect and the engine's
//! message union.
//!
//! Inbound, a `task` announces the session, `message` events carry content
//! as text and tagged data parts, and `status-update` events report
//! `input-required` (question or plan) and the terminal states. Outbound,
//! [`encode_event`] renders engine events in the same dialect so a worker
//! can serve either.

use corral_core::backend::BackendEvent;
use corral_core::messages::{
    AgentMessage, AssistantEnvelope, AssistantPayload, ResultMessage, UserContent, UserEnvelope, UserPayload,
    WireBlock,
};
use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::client::ProtocolError;

const KIND_TASK: &str = "task";
const KIND_MESSAGE: &str = "message";
const KIND_STATUS: &str = "status-update";

#[derive(Debug, Deserialize)]
#[serde(tag = "kind")]
enum A2aEvent {
    #[serde(rename = "task")]
    Task(Task),
    #[serde(rename = "message")]
    Message(A2aMessage),
    #[serde(rename = "status-update")]
    StatusUpdate(StatusUpdate),
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Task {
    id: String,
    #[serde(default)]
    context_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct A2aMessage {
    #[serde(default)]
    message_id: Option<String>,
    #[serde(default)]
    role: String,
    #[serde(default)]
    parts: Vec<Part>,
    #[serde(default)]
    metadata: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind")]
enum Part {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "data")]
    Data {
        data: Value,
        #[serde(default)]
        metadata: Map<String, Value>,
    },
    #[serde(other)]
    Other,
}

impl Part {
    fn hint(&self) -> Option<&str> {
        match self {
            Part::Data { data, metadata } => metadata
                .get("type")
                .and_then(Value::as_str)
                .or_else(|| data.get("type").and_then(Value::as_str)),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusUpdate {
    #[serde(default)]
    context_id: Option<String>,
    status: TaskStatus,
    #[serde(default)]
    metadata: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct TaskStatus {
    state: String,
    #[serde(default)]
    message: Option<A2aMessage>,
}

/// Stateful inbound translator; remembers the context id announced by the
/// task so later messages carry it.
#[derive(Debug, Default)]
pub struct A2aTranslator {
    context_id: Option<String>,
}

impl A2aTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Translate one frame's data. Accepts the bare event or a JSON-RPC
    /// envelope around it.
    pub fn translate_frame(&mut self, data: &str) -> Result<Vec<BackendEvent>, ProtocolError> {
        let value: Value =
            serde_json::from_str(data).map_err(|source| ProtocolError::Json { kind: "a2a".into(), source })?;
        if let Some(err) = value.get("error") {
            tracing::warn!(error = %err, "remote reported error");
            return Ok(Vec::new());
        }
        let event = value.get("result").cloned().unwrap_or(value);
        self.translate(event)
    }

    pub fn translate(&mut self, event: Value) -> Result<Vec<BackendEvent>, ProtocolError> {
        let event: A2aEvent =
            serde_json::from_value(event).map_err(|source| ProtocolError::Json { kind: "a2a".into(), source })?;
        Ok(match event {
            A2aEvent::Task(task) => {
                let context = task.context_id.unwrap_or_else(|| task.id.clone());
                self.context_id = Some(context.clone());
                vec![
                    BackendEvent::SessionStarted { native_session_id: task.id },
                    BackendEvent::Message(AgentMessage::system_init(context)),
                ]
            }
            A2aEvent::Message(msg) => self.message(msg).map(BackendEvent::Message).into_iter().collect(),
            A2aEvent::StatusUpdate(update) => self.status_update(update),
            A2aEvent::Other => Vec::new(),
        })
    }

    fn message(&self, msg: A2aMessage) -> Option<AgentMessage> {
        let assistant = match msg.metadata.get("type").and_then(Value::as_str) {
            Some("assistant") => true,
            Some("user") => false,
            _ => msg.role != "user",
        };
        let blocks: Vec<WireBlock> = msg.parts.iter().filter_map(part_to_block).collect();
        if blocks.is_empty() {
            return None;
        }
        let session_id = self.context_id.clone();
        Some(if assistant {
            AgentMessage::Assistant(AssistantEnvelope {
                message: AssistantPayload { id: msg.message_id, content: blocks, ..Default::default() },
                session_id,
                parent_tool_use_id: None,
            })
        } else {
            AgentMessage::User(UserEnvelope {
                message: UserPayload { role: "user".into(), content: UserContent::Blocks(blocks) },
                session_id,
                parent_tool_use_id: None,
                tool_use_result: None,
            })
        })
    }

    fn status_update(&mut self, update: StatusUpdate) -> Vec<BackendEvent> {
        if self.context_id.is_none() {
            self.context_id = update.context_id.clone();
        }
        match update.status.state.as_str() {
            "input-required" => {
                let payload = update
                    .status
                    .message
                    .as_ref()
                    .and_then(first_data)
                    .cloned()
                    .unwrap_or_else(|| Value::Object(update.metadata.clone()));
                let pending = update
                    .metadata
                    .get("pending")
                    .or_else(|| update.status.message.as_ref().and_then(|m| m.metadata.get("pending")))
                    .and_then(Value::as_str);
                match pending {
                    Some("plan") => vec![BackendEvent::PlanPending(payload)],
                    _ => vec![BackendEvent::QuestionPending(payload)],
                }
            }
            state @ ("completed" | "failed") => {
                let mut result = ResultMessage::success(self.context_id.clone());
                result.is_error = state == "failed";
                if result.is_error {
                    result.subtype = "error".into();
                }
                if let Some(msg) = &update.status.message {
                    if let Some(stats) = msg.parts.iter().find_map(|p| match p {
                        Part::Data { data, .. } if p.hint() == Some("result") => Some(data),
                        _ => None,
                    }) {
                        apply_result_stats(&mut result, stats);
                    }
                    let text: Vec<&str> = msg
                        .parts
                        .iter()
                        .filter_map(|p| match p {
                            Part::Text { text } => Some(text.as_str()),
                            _ => None,
                        })
                        .collect();
                    if !text.is_empty() {
                        result.result = Some(text.join("\n"));
                    }
                }
                vec![BackendEvent::Message(AgentMessage::Result(result))]
            }
            _ => update
                .status
                .message
                .and_then(|m| self.message(m))
                .map(BackendEvent::Message)
                .into_iter()
                .collect(),
        }
    }
}

fn first_data(msg: &A2aMessage) -> Option<&Value> {
    msg.parts.iter().find_map(|p| match p {
        Part::Data { data, .. } => Some(data),
        _ => None,
    })
}

fn apply_result_stats(result: &mut ResultMessage, stats: &Value) {
    result.total_cost_usd = stats
        .get("total_cost_usd")
        .or_else(|| stats.get("costUsd"))
        .and_then(Value::as_f64)
        .or(result.total_cost_usd);
    if let Some(d) = stats.get("duration_ms").or_else(|| stats.get("durationMs")).and_then(Value::as_u64) {
        result.duration_ms = d;
    }
    if let Some(n) = stats.get("num_turns").or_else(|| stats.get("numTurns")).and_then(Value::as_u64) {
        result.num_turns = u32::try_from(n).unwrap_or(u32::MAX);
    }
    if let Some(s) = stats.get("session_id").or_else(|| stats.get("sessionId")).and_then(Value::as_str) {
        result.session_id = Some(s.to_string());
    }
}

fn part_to_block(part: &Part) -> Option<WireBlock> {
    match part {
        Part::Text { text } => Some(WireBlock::Text { text: text.clone() }),
        Part::Data { data, .. } => {
            let field = |k: &str| data.get(k).and_then(Value::as_str).map(str::to_owned);
            match part.hint()? {
                "thinking" => Some(WireBlock::Thinking {
                    thinking: field("thinking").or_else(|| field("text")).unwrap_or_default(),
                    signature: field("signature"),
                }),
                "tool_use" => Some(WireBlock::ToolUse {
                    id: field("id")?,
                    name: field("name")?,
                    input: data.get("input").cloned().unwrap_or_else(|| json!({})),
                }),
                "tool_result" => Some(WireBlock::ToolResult {
                    tool_use_id: field("tool_use_id").or_else(|| field("toolUseId"))?,
                    content: data.get("content").cloned().unwrap_or(Value::Null),
                    is_error: data.get("is_error").and_then(Value::as_bool),
                }),
                _ => None,
            }
        }
        Part::Other => None,
    }
}

fn block_to_part(block: &WireBlock) -> Option<Value> {
    Some(match block {
        WireBlock::Text { text } => json!({"kind": "text", "text": text}),
        WireBlock::Thinking { thinking, signature } => json!({
            "kind": "data",
            "data": {"thinking": thinking, "signature": signature},
            "metadata": {"type": "thinking"},
        }),
        WireBlock::ToolUse { id, name, input } => json!({
            "kind": "data",
            "data": {"id": id, "name": name, "input": input},
            "metadata": {"type": "tool_use"},
        }),
        WireBlock::ToolResult { tool_use_id, content, is_error } => json!({
            "kind": "data",
            "data": {"tool_use_id": tool_use_id, "content": content, "is_error": is_error},
            "metadata": {"type": "tool_result"},
        }),
        WireBlock::Unknown => return None,
    })
}

/// Render an engine event in the task/message/status dialect. Streaming
/// deltas and system messages have no counterpart and yield `None`.
pub fn encode_event(event: &BackendEvent, task_id: &str) -> Option<Value> {
    match event {
        BackendEvent::SessionStarted { native_session_id } => Some(json!({
            "kind": KIND_TASK,
            "id": native_session_id,
            "contextId": native_session_id,
            "status": {"state": "working"},
        })),
        BackendEvent::QuestionPending(payload) => Some(input_required(task_id, payload, "question")),
        BackendEvent::PlanPending(payload) => Some(input_required(task_id, payload, "plan")),
        BackendEvent::Message(msg) => match msg {
            AgentMessage::Assistant(env) => {
                let parts: Vec<Value> = env.message.content.iter().filter_map(block_to_part).collect();
                Some(json!({
                    "kind": KIND_MESSAGE,
                    "messageId": env.message.id,
                    "role": "agent",
                    "taskId": task_id,
                    "parts": parts,
                    "metadata": {"type": "assistant"},
                }))
            }
            AgentMessage::User(env) => {
                let parts: Vec<Value> = match &env.message.content {
                    UserContent::Text(text) => vec![json!({"kind": "text", "text": text})],
                    UserContent::Blocks(blocks) => blocks.iter().filter_map(block_to_part).collect(),
                };
                Some(json!({
                    "kind": KIND_MESSAGE,
                    "role": "user",
                    "taskId": task_id,
                    "parts": parts,
                    "metadata": {"type": "user"},
                }))
            }
            AgentMessage::Result(result) => {
                let mut parts = vec![json!({
                    "kind": "data",
                    "data": {
                        "total_cost_usd": result.total_cost_usd,
                        "duration_ms": result.duration_ms,
                        "num_turns": result.num_turns,
                        "session_id": result.session_id,
                    },
                    "metadata": {"type": "result"},
                })];
                if let Some(text) = &result.result {
                    parts.push(json!({"kind": "text", "text": text}));
                }
                Some(json!({
                    "kind": KIND_STATUS,
                    "taskId": task_id,
                    "final": true,
                    "status": {
                        "state": if result.is_error { "failed" } else { "completed" },
                        "message": {"kind": KIND_MESSAGE, "role": "agent", "parts": parts},
                    },
                }))
            }
            AgentMessage::System(_) | AgentMessage::StreamEvent(_) => None,
        },
    }
}

fn input_required(task_id: &str, payload: &Value, pending: &str) -> Value {
    json!({
        "kind": KIND_STATUS,
        "taskId": task_id,
        "final": false,
        "status": {
            "state": "input-required",
            "message": {"kind": KIND_MESSAGE, "role": "agent", "parts": [{"kind": "data", "data": payload}]},
        },
        "metadata": {"pending": pending},
    })
}
