use std::path::PathBuf;
use std::sync::Arc;

use axum::routing::{delete, get, post};
use axum::Router;
use corral_core::backend::ExecutionBackend;
use corral_settings::WorkerSettings;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::handlers;

/// Worker server configuration.
#[derive(Clone, Debug)]
pub struct WorkerConfig {
    pub host: String,
    pub port: u16,
    /// Relative paths in `/api/files/read` resolve against this directory.
    pub root: PathBuf,
}

impl WorkerConfig {
    pub fn from_settings(settings: &WorkerSettings) -> Self {
        Self {
            host: settings.host.clone(),
            port: settings.port,
            root: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::from_settings(&WorkerSettings::default())
    }
}

/// Shared state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub backend: Arc<dyn ExecutionBackend>,
    pub root: Arc<PathBuf>,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(handlers::health))
        .route("/api/sessions", post(handlers::start_session))
        .route("/api/sessions/active", get(handlers::active_sessions))
        .route("/api/sessions/{id}", delete(handlers::stop_session))
        .route("/api/sessions/{id}/message", post(handlers::send_message))
        .route("/api/sessions/{id}/answer", post(handlers::answer_question))
        .route("/api/sessions/{id}/approve-plan", post(handlers::approve_plan))
        .route("/api/files/read", post(handlers::read_file))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Bind and serve. Returns once the listener is up.
pub async fn start(config: WorkerConfig, backend: Arc<dyn ExecutionBackend>) -> Result<WorkerHandle, std::io::Error> {
    let kind = backend.kind();
    let router = build_router(AppState { backend, root: Arc::new(config.root.clone()) });
    let listener = tokio::net::TcpListener::bind((config.host.as_str(), config.port)).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(addr = %local_addr, backend = %kind, root = %config.root.display(), "worker listening");

    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            tracing::error!(error = %e, "worker server exited");
        }
    });

    Ok(WorkerHandle { port: local_addr.port(), server })
}

/// Handle returned by [`start`].
pub struct WorkerHandle {
    pub port: u16,
    server: tokio::task::JoinHandle<()>,
}

impl WorkerHandle {
    pub fn base_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    pub async fn wait(self) {
        if let Err(e) = self.server.await {
            tracing::error!(error = %e, "worker server task failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use corral_backends::mock::{self, MockBackend, MockTurn};
    use corral_backends::worker::{MessageBody, StartBody};
    use corral_backends::WorkerClient;
    use corral_core::backend::{BackendEvent, PlanDecision};
    use corral_core::errors::BackendError;
    use corral_core::ids::SessionId;
    use corral_core::messages::AgentMessage;
    use corral_stream::WireProtocol;
    use futures::StreamExt;
    use tokio_util::sync::CancellationToken;

    async fn serve(backend: Arc<MockBackend>, root: PathBuf) -> WorkerHandle {
        let config = WorkerConfig { host: "127.0.0.1".into(), port: 0, root };
        start(config, backend).await.unwrap()
    }

    fn start_body() -> StartBody {
        StartBody {
            working_dir: "/workspace".into(),
            mode: "build".into(),
            model: "sonnet".into(),
            prompt: "hello".into(),
            system_prompt: None,
            resume_id: None,
            permission_mode: Some("acceptEdits".into()),
        }
    }

    async fn collect(mut stream: corral_core::backend::EventStream) -> Vec<BackendEvent> {
        let mut out = Vec::new();
        while let Some(item) = stream.next().await {
            match item {
                Ok(event) => out.push(event),
                Err(e) => panic!("unexpected stream error: {e}"),
            }
        }
        out
    }

    #[tokio::test]
    async fn health_endpoint() {
        let handle = serve(Arc::new(MockBackend::new(vec![])), PathBuf::from(".")).await;
        let resp = reqwest::get(format!("{}/api/health", handle.base_url())).await.unwrap();
        assert_eq!(resp.status(), 200);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn start_streams_worker_session_id_then_messages() {
        let backend = Arc::new(MockBackend::new(vec![MockTurn::messages(
            "local_inner",
            vec![mock::system_init("r1"), mock::assistant_text("m1", "hi"), mock::result_message()],
        )]));
        let handle = serve(backend.clone(), PathBuf::from(".")).await;
        let client = WorkerClient::new(WireProtocol::Native);

        let stream = client.start(&handle.base_url(), &start_body(), CancellationToken::new()).await.unwrap();
        let events = collect(stream).await;

        let worker_id = backend.starts()[0].session_id.to_string();
        assert!(matches!(&events[0], BackendEvent::SessionStarted { native_session_id } if *native_session_id == worker_id));
        assert!(matches!(&events[1], BackendEvent::Message(AgentMessage::System(_))));
        assert!(matches!(events.last(), Some(BackendEvent::Message(m)) if m.is_result()));
        assert_eq!(backend.starts()[0].permission_mode.as_str(), "acceptEdits");
    }

    #[tokio::test]
    async fn a2a_dialect_round_trips() {
        let backend = Arc::new(MockBackend::new(vec![MockTurn::messages(
            "local_inner",
            vec![mock::assistant_text("m1", "hi"), mock::result_with(0.1, 50)],
        )]));
        let handle = serve(backend, PathBuf::from(".")).await;
        let client = WorkerClient::new(WireProtocol::A2a);

        let stream = client.start(&handle.base_url(), &start_body(), CancellationToken::new()).await.unwrap();
        let events = collect(stream).await;
        assert!(matches!(&events[0], BackendEvent::SessionStarted { .. }));
        assert!(events.iter().any(|e| matches!(e, BackendEvent::Message(AgentMessage::Assistant(_)))));
        assert!(matches!(events.last(), Some(BackendEvent::Message(m)) if m.is_result()));
    }

    #[tokio::test]
    async fn message_to_unknown_session_is_not_found() {
        let backend = Arc::new(MockBackend::new(vec![MockTurn::Fail(BackendError::SessionNotFound("w-9".into()))]));
        let handle = serve(backend, PathBuf::from(".")).await;
        let client = WorkerClient::new(WireProtocol::Native);
        let body = MessageBody { message: "hi".into(), model: None, permission_mode: None };
        let err = client.message(&handle.base_url(), "w-9", &body, CancellationToken::new()).await.err().unwrap();
        assert!(matches!(err, BackendError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn bad_mode_is_rejected() {
        let handle = serve(Arc::new(MockBackend::new(vec![])), PathBuf::from(".")).await;
        let mut body = start_body();
        body.mode = "yolo".into();
        let resp = reqwest::Client::new()
            .post(format!("{}/api/sessions", handle.base_url()))
            .json(&body)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
    }

    #[tokio::test]
    async fn answer_plan_stop_and_active() {
        let backend = Arc::new(MockBackend::new(vec![MockTurn::completes("local_inner")]).with_out_of_band());
        let handle = serve(backend.clone(), PathBuf::from(".")).await;
        let base = handle.base_url();
        let client = WorkerClient::new(WireProtocol::Native);

        collect(client.start(&base, &start_body(), CancellationToken::new()).await.unwrap()).await;
        let id = backend.starts()[0].session_id.to_string();
        assert_eq!(client.active(&base).await.unwrap().len(), 1);

        let answers = HashMap::from([("Which?".to_string(), "A".to_string())]);
        assert!(client.answer(&base, &id, &answers).await.unwrap());
        let decision = PlanDecision { approved: true, keep_context: true, feedback: None };
        assert!(client.approve_plan(&base, &id, &decision).await.unwrap());

        client.delete(&base, &id).await.unwrap();
        assert_eq!(backend.stopped(), vec![SessionId::from_raw(id)]);
        assert!(client.active(&base).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reads_files_relative_to_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("PLAN.md"), "# Plan").unwrap();
        let handle = serve(Arc::new(MockBackend::new(vec![])), dir.path().to_path_buf()).await;
        let client = WorkerClient::new(WireProtocol::Native);
        assert_eq!(client.read_file(&handle.base_url(), "PLAN.md").await.unwrap().as_deref(), Some("# Plan"));
        assert_eq!(client.read_file(&handle.base_url(), "MISSING.md").await.unwrap(), None);
    }
}
