use std::collections::HashMap;
use std::pin::Pin;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::errors::BackendError;
use crate::ids::SessionId;
use crate::messages::AgentMessage;
use crate::session::{PermissionMode, SessionMode};

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Local,
    Docker,
    Cloud,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Docker => "docker",
            Self::Cloud => "cloud",
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BackendKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(Self::Local),
            "docker" => Ok(Self::Docker),
            "cloud" => Ok(Self::Cloud),
            other => Err(format!("unknown backend '{other}' (expected local, docker or cloud)")),
        }
    }
}

/// One item of a turn's event stream.
#[derive(Clone, Debug)]
pub enum BackendEvent {
    /// Always first: the backend-native session id for this logical session.
    SessionStarted { native_session_id: String },
    Message(AgentMessage),
    /// Raw question payload announced out-of-band by a worker.
    QuestionPending(Value),
    /// Raw plan payload announced out-of-band by a worker.
    PlanPending(Value),
}

pub type EventStream = Pin<Box<dyn Stream<Item = Result<BackendEvent, BackendError>> + Send>>;

/// Producer half of an [`EventStream`].
pub type EventSender = mpsc::UnboundedSender<Result<BackendEvent, BackendError>>;

/// Unbounded channel whose receiver is exposed as an [`EventStream`].
/// Producers run as their own task; the consumer reads sequentially.
pub fn event_channel() -> (EventSender, EventStream) {
    let (tx, rx) = mpsc::unbounded_channel();
    (tx, Box::pin(UnboundedReceiverStream::new(rx)))
}

#[derive(Clone, Debug)]
pub struct StartRequest {
    pub session_id: SessionId,
    pub working_dir: String,
    pub mode: SessionMode,
    pub model: String,
    pub prompt: String,
    pub system_prompt: Option<String>,
    pub resume_id: Option<String>,
    pub permission_mode: PermissionMode,
    /// Turn-scoped cancellation; the producer stops when it fires.
    pub cancel: CancellationToken,
}

#[derive(Clone, Debug)]
pub struct MessageRequest {
    pub session_id: SessionId,
    pub message: String,
    pub model: Option<String>,
    pub permission_mode: PermissionMode,
    pub cancel: CancellationToken,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlanDecision {
    pub approved: bool,
    #[serde(rename = "keepContext")]
    pub keep_context: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ContainerStatus {
    /// The backend has no container concept.
    NotApplicable,
    Missing,
    Running,
    Stopped,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContainerState {
    pub status: ContainerStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    pub healthy: bool,
}

impl ContainerState {
    pub fn not_applicable() -> Self {
        Self {
            status: ContainerStatus::NotApplicable,
            name: None,
            id: None,
            address: None,
            healthy: false,
        }
    }

    pub fn missing(name: impl Into<String>) -> Self {
        Self {
            status: ContainerStatus::Missing,
            name: Some(name.into()),
            id: None,
            address: None,
            healthy: false,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackendSessionSummary {
    pub session_id: SessionId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub native_session_id: Option<String>,
    pub working_dir: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

/// Uniform contract over the execution substrates. Every operation is keyed
/// by the engine's logical session id; native handles stay private to the
/// implementation.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    async fn start_session(&self, request: StartRequest) -> Result<EventStream, BackendError>;

    async fn send_message(&self, request: MessageRequest) -> Result<EventStream, BackendError>;

    /// Discard the backend session record.
    async fn stop_session(&self, session_id: &SessionId) -> Result<(), BackendError>;

    /// Abort the in-flight turn while keeping the backend session usable.
    async fn interrupt_session(&self, session_id: &SessionId) -> Result<(), BackendError>;

    /// `Ok(true)` when the answer was delivered out-of-band.
    async fn answer_question(
        &self,
        session_id: &SessionId,
        answers: &HashMap<String, String>,
    ) -> Result<bool, BackendError>;

    /// `Ok(true)` when the decision was delivered out-of-band.
    async fn approve_plan(&self, session_id: &SessionId, decision: &PlanDecision) -> Result<bool, BackendError>;

    async fn read_file_from_agent(&self, session_id: &SessionId, path: &str) -> Result<Option<String>, BackendError>;

    async fn container_state(&self, working_dir: &str) -> Result<ContainerState, BackendError>;

    /// Tear down the execution unit serving `working_dir`.
    async fn terminate_session(&self, working_dir: &str) -> Result<(), BackendError>;

    async fn list_sessions(&self) -> Result<Vec<BackendSessionSummary>, BackendError>;

    /// Remove managed resources no live record refers to. Returns how many
    /// were removed.
    async fn cleanup_orphans(&self) -> Result<usize, BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[test]
    fn backend_kind_parse_and_display() {
        assert_eq!("docker".parse::<BackendKind>().unwrap(), BackendKind::Docker);
        assert!("k8s".parse::<BackendKind>().is_err());
        assert_eq!(BackendKind::Cloud.to_string(), "cloud");
        assert_eq!(serde_json::to_string(&BackendKind::Local).unwrap(), "\"local\"");
    }

    #[test]
    fn plan_decision_wire_shape() {
        let d = PlanDecision { approved: false, keep_context: true, feedback: Some("tighter".into()) };
        let v = serde_json::to_value(&d).unwrap();
        assert_eq!(v["keepContext"], true);
        assert_eq!(v["feedback"], "tighter");
    }

    #[tokio::test]
    async fn event_channel_preserves_order_and_ends_on_drop() {
        let (tx, mut stream) = event_channel();
        tx.send(Ok(BackendEvent::SessionStarted { native_session_id: "n1".into() })).unwrap();
        tx.send(Err(BackendError::ConnectionLost("eof".into()))).unwrap();
        drop(tx);

        assert!(matches!(
            stream.next().await,
            Some(Ok(BackendEvent::SessionStarted { ref native_session_id })) if native_session_id == "n1"
        ));
        assert!(matches!(stream.next().await, Some(Err(BackendError::ConnectionLost(_)))));
        assert!(stream.next().await.is_none());
    }
}
