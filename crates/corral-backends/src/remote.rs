//! Session handling shared by the backends that talk to a worker over HTTP.
//!
//! A [`Provisioner`] owns the execution units (containers, cloud apps) and
//! hands out a healthy worker address per unit of work. [`RemoteBackend`]
//! keeps one record per logical session on top of that and forwards every
//! contract operation to the worker that serves it.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use corral_core::backend::{
    BackendEvent, BackendKind, BackendSessionSummary, ContainerState, EventStream, ExecutionBackend,
    MessageRequest, PlanDecision, StartRequest,
};
use corral_core::errors::BackendError;
use corral_core::ids::SessionId;
use dashmap::DashMap;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::worker::{MessageBody, StartBody, WorkerClient};

/// A healthy worker serving one unit of work.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecutionUnit {
    /// Deterministic name derived from the unit of work.
    pub name: String,
    /// Native container / app id.
    pub id: String,
    pub base_url: String,
}

/// Lifecycle of the external execution units behind a [`RemoteBackend`].
#[async_trait]
pub trait Provisioner: Send + Sync + 'static {
    fn kind(&self) -> BackendKind;

    fn unit_name(&self, working_dir: &str) -> String;

    /// Reuse or create a healthy unit for `working_dir`.
    async fn ensure_unit(&self, working_dir: &str) -> Result<ExecutionUnit, BackendError>;

    async fn unit_state(&self, working_dir: &str) -> Result<ContainerState, BackendError>;

    /// Remove the unit for `working_dir` and forget it.
    async fn teardown(&self, working_dir: &str) -> Result<(), BackendError>;

    /// Remove managed units that are not tracked. Returns the count.
    async fn cleanup_orphans(&self) -> Result<usize, BackendError>;

    /// Remove a unit once its last session stops.
    fn teardown_on_stop(&self) -> bool {
        false
    }
}

#[derive(Debug)]
struct RemoteSession {
    unit: String,
    working_dir: String,
    base_url: String,
    native_id: Option<String>,
    turn: CancellationToken,
    created_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
}

pub struct RemoteBackend<P> {
    provisioner: Arc<P>,
    client: WorkerClient,
    sessions: Arc<DashMap<SessionId, RemoteSession>>,
}

impl<P: Provisioner> RemoteBackend<P> {
    pub fn new(provisioner: Arc<P>, client: WorkerClient) -> Self {
        Self { provisioner, client, sessions: Arc::new(DashMap::new()) }
    }

    pub fn provisioner(&self) -> &Arc<P> {
        &self.provisioner
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Worker base URL and native session id of a live record.
    fn target(&self, session_id: &SessionId) -> Option<(String, String)> {
        let rec = self.sessions.get(session_id)?;
        Some((rec.base_url.clone(), rec.native_id.clone()?))
    }

    fn touch(&self, session_id: &SessionId) {
        if let Some(mut rec) = self.sessions.get_mut(session_id) {
            rec.last_activity = Utc::now();
        }
    }

    /// Record the worker session id as soon as the stream announces it.
    fn track(&self, session_id: SessionId, stream: EventStream) -> EventStream {
        let sessions = self.sessions.clone();
        Box::pin(stream.inspect(move |item| {
            if let Ok(BackendEvent::SessionStarted { native_session_id }) = item {
                if let Some(mut rec) = sessions.get_mut(&session_id) {
                    rec.native_id = Some(native_session_id.clone());
                    rec.last_activity = Utc::now();
                }
            }
        }))
    }
}

#[async_trait]
impl<P: Provisioner> ExecutionBackend for RemoteBackend<P> {
    fn kind(&self) -> BackendKind {
        self.provisioner.kind()
    }

    #[instrument(skip_all, fields(session_id = %request.session_id, backend = %self.provisioner.kind()))]
    async fn start_session(&self, request: StartRequest) -> Result<EventStream, BackendError> {
        let unit = self.provisioner.ensure_unit(&request.working_dir).await?;
        let turn = request.cancel.child_token();
        let now = Utc::now();
        let previous = self.sessions.insert(
            request.session_id.clone(),
            RemoteSession {
                unit: unit.name.clone(),
                working_dir: request.working_dir.clone(),
                base_url: unit.base_url.clone(),
                native_id: None,
                turn: turn.clone(),
                created_at: now,
                last_activity: now,
            },
        );
        if let Some(prev) = previous {
            tracing::debug!("replacing existing session record");
            prev.turn.cancel();
        }

        let body = StartBody {
            working_dir: request.working_dir.clone(),
            mode: request.mode.as_str().to_string(),
            model: request.model.clone(),
            prompt: request.prompt.clone(),
            system_prompt: request.system_prompt.clone(),
            resume_id: request.resume_id.clone(),
            permission_mode: Some(request.permission_mode.as_str().to_string()),
        };
        match self.client.start(&unit.base_url, &body, turn).await {
            Ok(stream) => Ok(self.track(request.session_id, stream)),
            Err(e) => {
                self.sessions.remove(&request.session_id);
                Err(e)
            }
        }
    }

    #[instrument(skip_all, fields(session_id = %request.session_id, backend = %self.provisioner.kind()))]
    async fn send_message(&self, request: MessageRequest) -> Result<EventStream, BackendError> {
        let turn = request.cancel.child_token();
        let (base, native_id) = {
            let mut rec = self
                .sessions
                .get_mut(&request.session_id)
                .ok_or_else(|| BackendError::SessionNotFound(request.session_id.to_string()))?;
            let native_id = rec
                .native_id
                .clone()
                .ok_or_else(|| BackendError::SessionNotFound(format!("{} has no worker session", request.session_id)))?;
            rec.turn = turn.clone();
            rec.last_activity = Utc::now();
            (rec.base_url.clone(), native_id)
        };
        let body = MessageBody {
            message: request.message,
            model: request.model,
            permission_mode: Some(request.permission_mode.as_str().to_string()),
        };
        let stream = self.client.message(&base, &native_id, &body, turn).await?;
        Ok(self.track(request.session_id, stream))
    }

    #[instrument(skip(self), fields(backend = %self.provisioner.kind()))]
    async fn stop_session(&self, session_id: &SessionId) -> Result<(), BackendError> {
        let Some((_, rec)) = self.sessions.remove(session_id) else {
            return Ok(());
        };
        rec.turn.cancel();
        if let Some(native_id) = &rec.native_id {
            if let Err(e) = self.client.delete(&rec.base_url, native_id).await {
                tracing::warn!(error = %e, "failed to close worker session");
            }
        }
        if self.provisioner.teardown_on_stop() && !self.sessions.iter().any(|s| s.unit == rec.unit) {
            tracing::info!(unit = %rec.unit, "last session stopped, tearing down unit");
            self.provisioner.teardown(&rec.working_dir).await?;
        }
        Ok(())
    }

    async fn interrupt_session(&self, session_id: &SessionId) -> Result<(), BackendError> {
        if let Some(rec) = self.sessions.get(session_id) {
            tracing::debug!(%session_id, "interrupting worker turn");
            rec.turn.cancel();
        }
        Ok(())
    }

    async fn answer_question(
        &self,
        session_id: &SessionId,
        answers: &HashMap<String, String>,
    ) -> Result<bool, BackendError> {
        let Some((base, native_id)) = self.target(session_id) else {
            return Ok(false);
        };
        self.touch(session_id);
        self.client.answer(&base, &native_id, answers).await
    }

    async fn approve_plan(&self, session_id: &SessionId, decision: &PlanDecision) -> Result<bool, BackendError> {
        let Some((base, native_id)) = self.target(session_id) else {
            return Ok(false);
        };
        self.touch(session_id);
        self.client.approve_plan(&base, &native_id, decision).await
    }

    async fn read_file_from_agent(&self, session_id: &SessionId, path: &str) -> Result<Option<String>, BackendError> {
        let Some(base) = self.sessions.get(session_id).map(|r| r.base_url.clone()) else {
            return Ok(None);
        };
        self.client.read_file(&base, path).await
    }

    async fn container_state(&self, working_dir: &str) -> Result<ContainerState, BackendError> {
        self.provisioner.unit_state(working_dir).await
    }

    #[instrument(skip(self), fields(backend = %self.provisioner.kind()))]
    async fn terminate_session(&self, working_dir: &str) -> Result<(), BackendError> {
        let unit = self.provisioner.unit_name(working_dir);
        let doomed: Vec<SessionId> =
            self.sessions.iter().filter(|s| s.unit == unit).map(|s| s.key().clone()).collect();
        for id in doomed {
            if let Some((_, rec)) = self.sessions.remove(&id) {
                rec.turn.cancel();
            }
        }
        self.provisioner.teardown(working_dir).await
    }

    async fn list_sessions(&self) -> Result<Vec<BackendSessionSummary>, BackendError> {
        Ok(self
            .sessions
            .iter()
            .map(|s| BackendSessionSummary {
                session_id: s.key().clone(),
                native_session_id: s.native_id.clone(),
                working_dir: s.working_dir.clone(),
                created_at: s.created_at,
                last_activity: s.last_activity,
            })
            .collect())
    }

    async fn cleanup_orphans(&self) -> Result<usize, BackendError> {
        self.provisioner.cleanup_orphans().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corral_core::backend::ContainerStatus;
    use corral_core::session::{PermissionMode, SessionMode};
    use corral_stream::WireProtocol;
    use parking_lot::Mutex;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Serves every unit from one fixed address.
    struct StaticProvisioner {
        base_url: String,
        teardown_on_stop: bool,
        torn_down: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Provisioner for StaticProvisioner {
        fn kind(&self) -> BackendKind {
            BackendKind::Docker
        }

        fn unit_name(&self, working_dir: &str) -> String {
            format!("unit-{}", working_dir.trim_start_matches('/'))
        }

        async fn ensure_unit(&self, working_dir: &str) -> Result<ExecutionUnit, BackendError> {
            Ok(ExecutionUnit { name: self.unit_name(working_dir), id: "c1".into(), base_url: self.base_url.clone() })
        }

        async fn unit_state(&self, working_dir: &str) -> Result<ContainerState, BackendError> {
            Ok(ContainerState::missing(self.unit_name(working_dir)))
        }

        async fn teardown(&self, working_dir: &str) -> Result<(), BackendError> {
            self.torn_down.lock().push(working_dir.to_string());
            Ok(())
        }

        async fn cleanup_orphans(&self) -> Result<usize, BackendError> {
            Ok(0)
        }

        fn teardown_on_stop(&self) -> bool {
            self.teardown_on_stop
        }
    }

    const TURN: &str = "event: session-started\ndata: {\"sessionId\":\"w-7\"}\n\n\
        event: result\ndata: {\"type\":\"result\"}\n\n";

    async fn worker() -> MockServer {
        let server = MockServer::start().await;
        let sse = |body: &'static str| {
            ResponseTemplate::new(200).insert_header("content-type", "text/event-stream").set_body_string(body)
        };
        Mock::given(method("POST")).and(path("/api/sessions")).respond_with(sse(TURN)).mount(&server).await;
        Mock::given(method("POST")).and(path("/api/sessions/w-7/message")).respond_with(sse(TURN)).mount(&server).await;
        Mock::given(method("DELETE")).and(path("/api/sessions/w-7")).respond_with(ResponseTemplate::new(204)).mount(&server).await;
        server
    }

    fn backend(server: &MockServer, teardown_on_stop: bool) -> RemoteBackend<StaticProvisioner> {
        let provisioner = StaticProvisioner {
            base_url: server.uri(),
            teardown_on_stop,
            torn_down: Mutex::new(Vec::new()),
        };
        RemoteBackend::new(Arc::new(provisioner), WorkerClient::new(WireProtocol::Native))
    }

    fn start_request(id: &SessionId) -> StartRequest {
        StartRequest {
            session_id: id.clone(),
            working_dir: "/work/a".into(),
            mode: SessionMode::Build,
            model: "sonnet".into(),
            prompt: "hi".into(),
            system_prompt: None,
            resume_id: None,
            permission_mode: PermissionMode::AcceptEdits,
            cancel: CancellationToken::new(),
        }
    }

    fn message_request(id: &SessionId) -> MessageRequest {
        MessageRequest {
            session_id: id.clone(),
            message: "again".into(),
            model: None,
            permission_mode: PermissionMode::AcceptEdits,
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn native_id_learned_from_stream_and_reused() {
        let server = worker().await;
        let backend = backend(&server, false);
        let id = SessionId::new();

        let stream = backend.start_session(start_request(&id)).await.unwrap();
        let _: Vec<_> = stream.collect().await;
        let sessions = backend.list_sessions().await.unwrap();
        assert_eq!(sessions[0].native_session_id.as_deref(), Some("w-7"));

        let events: Vec<_> = backend.send_message(message_request(&id)).await.unwrap().collect().await;
        assert!(matches!(events.last(), Some(Ok(BackendEvent::Message(m))) if m.is_result()));
    }

    #[tokio::test]
    async fn message_without_record_is_session_not_found() {
        let server = worker().await;
        let backend = backend(&server, false);
        let err = match backend.send_message(message_request(&SessionId::new())).await {
            Err(e) => e,
            Ok(_) => panic!("expected an error"),
        };
        assert!(matches!(err, BackendError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn one_record_per_session() {
        let server = worker().await;
        let backend = backend(&server, false);
        let id = SessionId::new();
        let first = start_request(&id);
        let first_cancel = first.cancel.clone();
        let _s1 = backend.start_session(first).await.unwrap();
        let _s2 = backend.start_session(start_request(&id)).await.unwrap();
        assert_eq!(backend.session_count(), 1);
        // the replaced record's turn scope is a child of the caller's token
        assert!(!first_cancel.is_cancelled());
    }

    #[tokio::test]
    async fn stop_tears_down_last_session_when_configured() {
        let server = worker().await;
        let backend = backend(&server, true);
        let id = SessionId::new();
        let _: Vec<_> = backend.start_session(start_request(&id)).await.unwrap().collect().await;
        backend.stop_session(&id).await.unwrap();
        assert_eq!(backend.session_count(), 0);
        assert_eq!(*backend.provisioner().torn_down.lock(), vec!["/work/a".to_string()]);
    }

    #[tokio::test]
    async fn answers_without_worker_session_fall_through() {
        let server = worker().await;
        let backend = backend(&server, false);
        let id = SessionId::new();
        assert!(!backend.answer_question(&id, &HashMap::new()).await.unwrap());
        let decision = PlanDecision { approved: true, keep_context: true, feedback: None };
        assert!(!backend.approve_plan(&id, &decision).await.unwrap());
        assert_eq!(backend.read_file_from_agent(&id, "PLAN.md").await.unwrap(), None);
    }

    #[tokio::test]
    async fn terminate_drops_sessions_of_the_unit() {
        let server = worker().await;
        let backend = backend(&server, false);
        let id = SessionId::new();
        let _s = backend.start_session(start_request(&id)).await.unwrap();
        backend.terminate_session("/work/a").await.unwrap();
        assert_eq!(backend.session_count(), 0);
        let state = backend.container_state("/work/a").await.unwrap();
        assert_eq!(state.status, ContainerStatus::Missing);
    }
}
