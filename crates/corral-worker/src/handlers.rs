//! Route handlers for the worker HTTP surface.

use std::path::{Path as FsPath, PathBuf};

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use corral_backends::worker::{
    AnswerBody, FileReply, MessageBody, ReadFileBody, ResolvedReply, StartBody, PROTOCOL_HEADER,
};
use corral_core::backend::{MessageRequest, PlanDecision, StartRequest};
use corral_core::errors::BackendError;
use corral_core::ids::SessionId;
use corral_core::session::{PermissionMode, SessionMode};
use corral_stream::WireProtocol;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::events::{sse_response, EventEncoder};
use crate::server::AppState;

/// Error reply: `{error, kind}` with a status derived from the failure.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Backend(BackendError),
}

impl From<BackendError> for ApiError {
    fn from(err: BackendError) -> Self {
        Self::Backend(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind, message) = match self {
            Self::BadRequest(m) => (StatusCode::BAD_REQUEST, "bad_request", m),
            Self::NotFound(m) => (StatusCode::NOT_FOUND, "not_found", m),
            Self::Backend(e) => {
                let status = match &e {
                    BackendError::SessionNotFound(_) => StatusCode::NOT_FOUND,
                    BackendError::Unsupported { .. } => StatusCode::NOT_IMPLEMENTED,
                    BackendError::StartupFailure(_) => StatusCode::SERVICE_UNAVAILABLE,
                    BackendError::ConnectionLost(_) => StatusCode::BAD_GATEWAY,
                    BackendError::Http { status, .. } => {
                        StatusCode::from_u16(*status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
                    }
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, e.error_kind(), e.to_string())
            }
        };
        (status, Json(json!({ "error": message, "kind": kind }))).into_response()
    }
}

fn protocol(headers: &HeaderMap) -> WireProtocol {
    match headers.get(PROTOCOL_HEADER).and_then(|v| v.to_str().ok()) {
        Some("a2a") => WireProtocol::A2a,
        _ => WireProtocol::Native,
    }
}

fn permission(raw: Option<&str>, fallback: PermissionMode) -> Result<PermissionMode, ApiError> {
    match raw {
        Some(raw) => raw.parse().map_err(ApiError::BadRequest),
        None => Ok(fallback),
    }
}

pub async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

pub async fn start_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<StartBody>,
) -> Result<Response, ApiError> {
    let mode: SessionMode = body.mode.parse().map_err(ApiError::BadRequest)?;
    let permission_mode = permission(body.permission_mode.as_deref(), mode.default_permission())?;
    let session_id = SessionId::new();
    let cancel = CancellationToken::new();
    let request = StartRequest {
        session_id: session_id.clone(),
        working_dir: body.working_dir,
        mode,
        model: body.model,
        prompt: body.prompt,
        system_prompt: body.system_prompt,
        resume_id: body.resume_id,
        permission_mode,
        cancel: cancel.clone(),
    };
    let events = state.backend.start_session(request).await?;
    tracing::info!(session_id = %session_id, "worker session started");
    let encoder = EventEncoder::new(protocol(&headers), session_id.as_str());
    Ok(sse_response(encoder, true, events, cancel).into_response())
}

pub async fn send_message(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<MessageBody>,
) -> Result<Response, ApiError> {
    let permission_mode = permission(body.permission_mode.as_deref(), PermissionMode::Default)?;
    let cancel = CancellationToken::new();
    let request = MessageRequest {
        session_id: SessionId::from_raw(id.clone()),
        message: body.message,
        model: body.model,
        permission_mode,
        cancel: cancel.clone(),
    };
    let events = state.backend.send_message(request).await?;
    let encoder = EventEncoder::new(protocol(&headers), id);
    Ok(sse_response(encoder, false, events, cancel).into_response())
}

pub async fn stop_session(State(state): State<AppState>, Path(id): Path<String>) -> Result<StatusCode, ApiError> {
    state.backend.stop_session(&SessionId::from_raw(id.clone())).await?;
    tracing::info!(session_id = %id, "worker session stopped");
    Ok(StatusCode::NO_CONTENT)
}

pub async fn answer_question(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<AnswerBody>,
) -> Result<Json<ResolvedReply>, ApiError> {
    let resolved = state.backend.answer_question(&SessionId::from_raw(id), &body.answers).await?;
    Ok(Json(ResolvedReply { resolved }))
}

pub async fn approve_plan(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(decision): Json<PlanDecision>,
) -> Result<Json<ResolvedReply>, ApiError> {
    let resolved = state.backend.approve_plan(&SessionId::from_raw(id), &decision).await?;
    Ok(Json(ResolvedReply { resolved }))
}

pub async fn active_sessions(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let sessions = state.backend.list_sessions().await?;
    Ok(Json(json!({ "sessions": sessions })))
}

fn resolve(root: &FsPath, path: &str) -> PathBuf {
    let p = FsPath::new(path);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        root.join(p)
    }
}

pub async fn read_file(
    State(state): State<AppState>,
    Json(body): Json<ReadFileBody>,
) -> Result<Json<FileReply>, ApiError> {
    if body.file_path.trim().is_empty() {
        return Err(ApiError::BadRequest("filePath is required".into()));
    }
    let path = resolve(&state.root, &body.file_path);
    match tokio::fs::read_to_string(&path).await {
        Ok(content) => Ok(Json(FileReply { content: Some(content) })),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(ApiError::NotFound(format!("{} not found", path.display())))
        }
        Err(e) => Err(BackendError::from(e).into()),
    }
}
