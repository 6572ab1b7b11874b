//! Wire message union streamed by the agent process.
//!
//! Every frame the agent emits is one [`AgentMessage`], discriminated by its
//! `type` field (`system`, `assistant`, `user`, `result`, `stream_event`).
//! Content blocks inside assistant/user payloads and the raw streaming
//! events are themselves tagged unions. Unknown sub-kinds decode to an
//! `Unknown`/`Other` variant so new agent versions don't break the stream.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AgentMessage {
    #[serde(rename = "system")]
    System(SystemMessage),
    #[serde(rename = "assistant")]
    Assistant(AssistantEnvelope),
    #[serde(rename = "user")]
    User(UserEnvelope),
    #[serde(rename = "result")]
    Result(ResultMessage),
    #[serde(rename = "stream_event")]
    StreamEvent(StreamEventEnvelope),
}

impl AgentMessage {
    /// Decode one JSON payload. This is the single dispatch point for the
    /// message union.
    pub fn decode(data: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(data)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::System(_) => "system",
            Self::Assistant(_) => "assistant",
            Self::User(_) => "user",
            Self::Result(_) => "result",
            Self::StreamEvent(_) => "stream_event",
        }
    }

    pub fn is_result(&self) -> bool {
        matches!(self, Self::Result(_))
    }

    /// Backend-native resumable id carried by the message, if any.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::System(m) => m.session_id.as_deref(),
            Self::Assistant(m) => m.session_id.as_deref(),
            Self::User(m) => m.session_id.as_deref(),
            Self::Result(m) => m.session_id.as_deref(),
            Self::StreamEvent(m) => m.session_id.as_deref(),
        }
    }

    pub fn system_init(session_id: impl Into<String>) -> Self {
        Self::System(SystemMessage {
            subtype: "init".into(),
            session_id: Some(session_id.into()),
            model: None,
            cwd: None,
            permission_mode: None,
            tools: Vec::new(),
        })
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SystemMessage {
    pub subtype: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default, rename = "permissionMode", skip_serializing_if = "Option::is_none")]
    pub permission_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<String>,
}

impl SystemMessage {
    pub fn is_init(&self) -> bool {
        self.subtype == "init"
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AssistantEnvelope {
    pub message: AssistantPayload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_tool_use_id: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AssistantPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub content: Vec<WireBlock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Value>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UserEnvelope {
    pub message: UserPayload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_tool_use_id: Option<String>,
    /// Structured result some tools attach next to the plain tool_result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_use_result: Option<Value>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UserPayload {
    #[serde(default = "default_user_role")]
    pub role: String,
    pub content: UserContent,
}

fn default_user_role() -> String {
    "user".into()
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UserContent {
    Text(String),
    Blocks(Vec<WireBlock>),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResultMessage {
    #[serde(default = "default_result_subtype")]
    pub subtype: String,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub duration_api_ms: u64,
    #[serde(default)]
    pub num_turns: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_cost_usd: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

fn default_result_subtype() -> String {
    "success".into()
}

impl ResultMessage {
    pub fn success(session_id: Option<String>) -> Self {
        Self {
            subtype: default_result_subtype(),
            is_error: false,
            duration_ms: 0,
            duration_api_ms: 0,
            num_turns: 0,
            total_cost_usd: None,
            result: None,
            session_id,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StreamEventEnvelope {
    pub event: RawStreamEvent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_tool_use_id: Option<String>,
}

/// Content block as it appears on the wire.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum WireBlock {
    #[serde(rename = "text")]
    Text {
        #[serde(default)]
        text: String,
    },
    #[serde(rename = "thinking")]
    Thinking {
        #[serde(default)]
        thinking: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Value,
        #[serde(default)]
        is_error: Option<bool>,
    },
    #[serde(other)]
    Unknown,
}

/// Incremental streaming events (one assistant message at a time).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RawStreamEvent {
    #[serde(rename = "message_start")]
    MessageStart {
        #[serde(default)]
        message: Value,
    },
    #[serde(rename = "content_block_start")]
    ContentBlockStart { index: usize, content_block: WireBlock },
    #[serde(rename = "content_block_delta")]
    ContentBlockDelta { index: usize, delta: BlockDelta },
    #[serde(rename = "content_block_stop")]
    ContentBlockStop { index: usize },
    #[serde(rename = "message_delta")]
    MessageDelta {
        #[serde(default)]
        delta: Value,
        #[serde(default)]
        usage: Option<Value>,
    },
    #[serde(rename = "message_stop")]
    MessageStop,
    #[serde(other)]
    Other,
}

impl RawStreamEvent {
    /// Message id announced by `message_start`, used to de-duplicate the
    /// complete assistant message that follows a streamed one.
    pub fn message_id(&self) -> Option<&str> {
        match self {
            Self::MessageStart { message } => message.get("id").and_then(Value::as_str),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum BlockDelta {
    #[serde(rename = "text_delta")]
    Text { text: String },
    #[serde(rename = "thinking_delta")]
    Thinking { thinking: String },
    #[serde(rename = "input_json_delta")]
    InputJson { partial_json: String },
    #[serde(rename = "signature_delta")]
    Signature { signature: String },
    #[serde(other)]
    Other,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_system_init() {
        let msg = AgentMessage::decode(
            r#"{"type":"system","subtype":"init","session_id":"abc","model":"sonnet","cwd":"/w","tools":["Read"]}"#,
        )
        .unwrap();
        assert_eq!(msg.kind(), "system");
        assert_eq!(msg.session_id(), Some("abc"));
        match msg {
            AgentMessage::System(s) => {
                assert!(s.is_init());
                assert_eq!(s.tools, vec!["Read".to_string()]);
            }
            other => panic!("expected system, got {other:?}"),
        }
    }

    #[test]
    fn decodes_assistant_with_mixed_blocks() {
        let msg = AgentMessage::decode(
            r#"{"type":"assistant","message":{"id":"m1","content":[
                {"type":"thinking","thinking":"hmm"},
                {"type":"text","text":"hi"},
                {"type":"tool_use","id":"t1","name":"Read","input":{"file_path":"/a"}},
                {"type":"server_tool_use","id":"x"}
            ]},"session_id":"abc"}"#,
        )
        .unwrap();
        let AgentMessage::Assistant(env) = msg else {
            panic!("expected assistant");
        };
        assert_eq!(env.message.id.as_deref(), Some("m1"));
        assert_eq!(env.message.content.len(), 4);
        assert!(matches!(env.message.content[3], WireBlock::Unknown));
    }

    #[test]
    fn decodes_user_string_and_blocks() {
        let text = AgentMessage::decode(r#"{"type":"user","message":{"role":"user","content":"hello"}}"#).unwrap();
        assert!(matches!(
            text,
            AgentMessage::User(UserEnvelope { message: UserPayload { content: UserContent::Text(_), .. }, .. })
        ));

        let blocks = AgentMessage::decode(
            r#"{"type":"user","message":{"content":[{"type":"tool_result","tool_use_id":"t1","content":"ok"}]},
                "tool_use_result":{"stdout":"ok","stderr":""}}"#,
        )
        .unwrap();
        let AgentMessage::User(env) = blocks else {
            panic!("expected user");
        };
        assert!(env.tool_use_result.is_some());
        assert!(matches!(env.message.content, UserContent::Blocks(ref b) if b.len() == 1));
    }

    #[test]
    fn decodes_result_with_defaults() {
        let msg = AgentMessage::decode(r#"{"type":"result","total_cost_usd":0.25,"num_turns":3}"#).unwrap();
        assert!(msg.is_result());
        let AgentMessage::Result(r) = msg else { unreachable!() };
        assert_eq!(r.subtype, "success");
        assert!(!r.is_error);
        assert_eq!(r.num_turns, 3);
        assert_eq!(r.total_cost_usd, Some(0.25));
    }

    #[test]
    fn decodes_stream_events() {
        let start = AgentMessage::decode(
            r#"{"type":"stream_event","event":{"type":"message_start","message":{"id":"msg_9"}}}"#,
        )
        .unwrap();
        let AgentMessage::StreamEvent(env) = start else { unreachable!() };
        assert_eq!(env.event.message_id(), Some("msg_9"));

        let delta = AgentMessage::decode(
            r#"{"type":"stream_event","event":{"type":"content_block_delta","index":2,"delta":{"type":"input_json_delta","partial_json":"{\"a\""}}}"#,
        )
        .unwrap();
        let AgentMessage::StreamEvent(env) = delta else { unreachable!() };
        match env.event {
            RawStreamEvent::ContentBlockDelta { index, delta } => {
                assert_eq!(index, 2);
                assert_eq!(delta, BlockDelta::InputJson { partial_json: "{\"a\"".into() });
            }
            other => panic!("unexpected {other:?}"),
        }

        let ping = AgentMessage::decode(r#"{"type":"stream_event","event":{"type":"ping"}}"#).unwrap();
        assert!(matches!(ping, AgentMessage::StreamEvent(StreamEventEnvelope { event: RawStreamEvent::Other, .. })));
    }

    #[test]
    fn unknown_top_level_type_is_an_error() {
        assert!(AgentMessage::decode(r#"{"type":"mystery"}"#).is_err());
        assert!(AgentMessage::decode("not json").is_err());
    }
}
