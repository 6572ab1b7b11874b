//! Interfaces to the services the engine consumes but does not own: hook
//! execution, resume metadata, the message cache and the real-time sink.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::content::Message;
use crate::ids::SessionId;
use crate::session::{PendingPlan, PendingQuestion, SessionMode, SessionStatus};

/// Error reported by a collaborator. Opaque to the engine.
#[derive(Clone, Debug, thiserror::Error)]
#[error("{0}")]
pub struct CollaboratorError(pub String);

impl CollaboratorError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct HookOutput {
    pub success: bool,
    pub output: String,
}

#[async_trait]
pub trait HookRunner: Send + Sync {
    async fn execute_session_start_hooks(&self, working_dir: &str) -> Result<Vec<HookOutput>, CollaboratorError>;
}

/// Parameters needed to resume a backend-native conversation.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SessionMetadata {
    pub native_session_id: String,
    pub session_id: SessionId,
    pub working_dir: String,
    pub model: String,
    pub mode: SessionMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
}

#[async_trait]
pub trait SessionMetadataStore: Send + Sync {
    async fn get(&self, native_session_id: &str) -> Result<Option<SessionMetadata>, CollaboratorError>;
    async fn save(&self, metadata: SessionMetadata) -> Result<(), CollaboratorError>;
    async fn remove(&self, native_session_id: &str) -> Result<(), CollaboratorError>;
}

#[async_trait]
pub trait MessageCache: Send + Sync {
    async fn initialize(&self, session_id: &SessionId) -> Result<(), CollaboratorError>;
    async fn append(&self, session_id: &SessionId, message: &Message) -> Result<(), CollaboratorError>;
    async fn list(&self, session_id: &SessionId) -> Result<Vec<Message>, CollaboratorError>;
}

/// Real-time notification published to the presentation layer.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    Started {
        session_id: SessionId,
        working_dir: String,
    },
    Stopped {
        session_id: SessionId,
    },
    StatusChanged {
        session_id: SessionId,
        status: SessionStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    MessageReceived {
        session_id: SessionId,
        message: Message,
    },
    QuestionReceived {
        session_id: SessionId,
        question: PendingQuestion,
    },
    PlanReceived {
        session_id: SessionId,
        plan: PendingPlan,
    },
}

impl SessionEvent {
    pub fn session_id(&self) -> &SessionId {
        match self {
            Self::Started { session_id, .. }
            | Self::Stopped { session_id }
            | Self::StatusChanged { session_id, .. }
            | Self::MessageReceived { session_id, .. }
            | Self::QuestionReceived { session_id, .. }
            | Self::PlanReceived { session_id, .. } => session_id,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Started { .. } => "started",
            Self::Stopped { .. } => "stopped",
            Self::StatusChanged { .. } => "status_changed",
            Self::MessageReceived { .. } => "message_received",
            Self::QuestionReceived { .. } => "question_received",
            Self::PlanReceived { .. } => "plan_received",
        }
    }
}

/// Fire-and-forget sink; publishing never fails the caller.
pub trait SessionBroadcaster: Send + Sync {
    fn publish(&self, event: SessionEvent);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_event_serializes_with_type_tag() {
        let id = SessionId::from_raw("sess_1");
        let event = SessionEvent::StatusChanged {
            session_id: id.clone(),
            status: SessionStatus::WaitingForInput,
            error: None,
        };
        let v = serde_json::to_value(&event).unwrap();
        assert_eq!(v["type"], "status_changed");
        assert_eq!(v["status"], "waiting_for_input");
        assert!(v.get("error").is_none());
        assert_eq!(event.session_id(), &id);
        assert_eq!(event.event_type(), "status_changed");
    }

    #[test]
    fn metadata_round_trips() {
        let meta = SessionMetadata {
            native_session_id: "native".into(),
            session_id: SessionId::from_raw("sess_1"),
            working_dir: "/w".into(),
            model: "opus".into(),
            mode: SessionMode::Plan,
            system_prompt: None,
        };
        let back: SessionMetadata = serde_json::from_str(&serde_json::to_string(&meta).unwrap()).unwrap();
        assert_eq!(back, meta);
    }
}
