//! In-process backend: the agent runs as a child process of the engine (or
//! of a worker inside a container), one invocation per turn.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use corral_core::backend::{
    event_channel, BackendEvent, BackendKind, BackendSessionSummary, ContainerState, EventStream, ExecutionBackend,
    MessageRequest, PlanDecision, StartRequest,
};
use corral_core::errors::BackendError;
use corral_core::ids::SessionId;
use corral_core::messages::AgentMessage;
use corral_core::session::PermissionMode;
use corral_settings::LocalSettings;
use dashmap::DashMap;
use futures::StreamExt;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

/// Lines of agent stderr kept for the error raised when it exits early.
const STDERR_TAIL_LINES: usize = 20;

/// One turn's worth of options. Built fresh for every message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AgentInvocation {
    pub working_dir: String,
    pub prompt: String,
    pub model: String,
    pub permission_mode: PermissionMode,
    pub resume_id: Option<String>,
    pub system_prompt: Option<String>,
}

/// Runs the agent for one turn. The returned stream carries only
/// [`BackendEvent::Message`] items.
#[async_trait]
pub trait AgentRuntime: Send + Sync + 'static {
    async fn run(&self, invocation: AgentInvocation, cancel: CancellationToken) -> Result<EventStream, BackendError>;
}

/// Spawns the agent CLI in streaming-JSON print mode.
pub struct ClaudeCliRuntime {
    binary: String,
    extra_args: Vec<String>,
}

impl ClaudeCliRuntime {
    pub fn new(settings: &LocalSettings) -> Self {
        Self { binary: settings.agent_binary.clone(), extra_args: settings.extra_args.clone() }
    }

    pub fn args(&self, inv: &AgentInvocation) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            inv.prompt.clone(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
            "--include-partial-messages".to_string(),
            "--permission-mode".to_string(),
            inv.permission_mode.as_str().to_string(),
            "--model".to_string(),
            inv.model.clone(),
        ];
        if let Some(resume) = &inv.resume_id {
            args.push("--resume".to_string());
            args.push(resume.clone());
        }
        if let Some(prompt) = inv.system_prompt.as_deref().filter(|p| !p.trim().is_empty()) {
            args.push("--append-system-prompt".to_string());
            args.push(prompt.to_string());
        }
        args.extend(self.extra_args.iter().cloned());
        args
    }
}

fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().collect();
    all[all.len().saturating_sub(lines)..].join("\n")
}

#[async_trait]
impl AgentRuntime for ClaudeCliRuntime {
    async fn run(&self, invocation: AgentInvocation, cancel: CancellationToken) -> Result<EventStream, BackendError> {
        let mut child = Command::new(&self.binary)
            .args(self.args(&invocation))
            .current_dir(&invocation.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| BackendError::StartupFailure(format!("failed to spawn {}: {e}", self.binary)))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BackendError::StartupFailure("agent stdout not captured".into()))?;
        let stderr = child.stderr.take();
        tracing::debug!(pid = child.id(), model = %invocation.model, "agent process started");

        let (tx, stream) = event_channel();
        tokio::spawn(async move {
            let stderr_task = tokio::spawn(async move {
                let mut buf = String::new();
                if let Some(mut err) = stderr {
                    let _ = err.read_to_string(&mut buf).await;
                }
                buf
            });
            let mut lines = BufReader::new(stdout).lines();
            let mut saw_result = false;
            loop {
                let line = tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::debug!("turn cancelled, killing agent");
                        let _ = child.kill().await;
                        return;
                    }
                    line = lines.next_line() => line,
                };
                match line {
                    Ok(Some(line)) if line.trim().is_empty() => {}
                    Ok(Some(line)) => match AgentMessage::decode(&line) {
                        Ok(msg) => {
                            saw_result |= msg.is_result();
                            if tx.send(Ok(BackendEvent::Message(msg))).is_err() {
                                let _ = child.kill().await;
                                return;
                            }
                        }
                        Err(e) => tracing::warn!(error = %e, "dropping malformed agent line"),
                    },
                    Ok(None) => break,
                    Err(e) => {
                        let _ = tx.send(Err(BackendError::ConnectionLost(format!("agent stdout: {e}"))));
                        let _ = child.kill().await;
                        return;
                    }
                }
            }
            let status = child.wait().await;
            if !saw_result {
                let stderr = stderr_task.await.unwrap_or_default();
                let status = status.map(|s| s.to_string()).unwrap_or_else(|e| e.to_string());
                let _ = tx.send(Err(BackendError::ConnectionLost(format!(
                    "agent exited ({status}) before result: {}",
                    tail(&stderr, STDERR_TAIL_LINES)
                ))));
            }
        });
        Ok(stream)
    }
}

#[derive(Debug)]
struct LocalSession {
    native_id: String,
    working_dir: String,
    model: String,
    system_prompt: Option<String>,
    /// Resumable conversation id reported by the agent.
    resume_id: Option<String>,
    turn: CancellationToken,
    created_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
}

pub struct LocalBackend {
    runtime: Arc<dyn AgentRuntime>,
    sessions: Arc<DashMap<SessionId, LocalSession>>,
}

impl LocalBackend {
    pub fn new(runtime: Arc<dyn AgentRuntime>) -> Self {
        Self { runtime, sessions: Arc::new(DashMap::new()) }
    }

    pub fn from_settings(settings: &LocalSettings) -> Self {
        Self::new(Arc::new(ClaudeCliRuntime::new(settings)))
    }

    /// Prefix the synthetic session-started event and keep the resume id
    /// current as the agent reports it.
    fn wrap(&self, session_id: SessionId, native_id: String, stream: EventStream) -> EventStream {
        let sessions = self.sessions.clone();
        let tracked = stream.inspect(move |item| {
            let Ok(BackendEvent::Message(msg)) = item else { return };
            let resume = match msg {
                AgentMessage::System(s) if s.is_init() => s.session_id.as_deref(),
                AgentMessage::Result(r) => r.session_id.as_deref(),
                _ => None,
            };
            if let Some(mut rec) = sessions.get_mut(&session_id) {
                rec.last_activity = Utc::now();
                if let Some(resume) = resume {
                    rec.resume_id = Some(resume.to_string());
                }
            }
        });
        let head = futures::stream::iter([Ok(BackendEvent::SessionStarted { native_session_id: native_id })]);
        Box::pin(head.chain(tracked))
    }
}

fn resolve(working_dir: &str, path: &str) -> PathBuf {
    let p = Path::new(path);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        Path::new(working_dir).join(p)
    }
}

#[async_trait]
impl ExecutionBackend for LocalBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    #[instrument(skip_all, fields(session_id = %request.session_id, backend = "local"))]
    async fn start_session(&self, request: StartRequest) -> Result<EventStream, BackendError> {
        let native_id = format!("local_{}", uuid::Uuid::now_v7().simple());
        let turn = request.cancel.child_token();
        let now = Utc::now();
        if let Some(prev) = self.sessions.insert(
            request.session_id.clone(),
            LocalSession {
                native_id: native_id.clone(),
                working_dir: request.working_dir.clone(),
                model: request.model.clone(),
                system_prompt: request.system_prompt.clone(),
                resume_id: request.resume_id.clone(),
                turn: turn.clone(),
                created_at: now,
                last_activity: now,
            },
        ) {
            prev.turn.cancel();
        }

        let invocation = AgentInvocation {
            working_dir: request.working_dir,
            prompt: request.prompt,
            model: request.model,
            permission_mode: request.permission_mode,
            resume_id: request.resume_id,
            system_prompt: request.system_prompt,
        };
        match self.runtime.run(invocation, turn).await {
            Ok(stream) => Ok(self.wrap(request.session_id, native_id, stream)),
            Err(e) => {
                self.sessions.remove(&request.session_id);
                Err(e)
            }
        }
    }

    #[instrument(skip_all, fields(session_id = %request.session_id, backend = "local"))]
    async fn send_message(&self, request: MessageRequest) -> Result<EventStream, BackendError> {
        let turn = request.cancel.child_token();
        let (native_id, invocation) = {
            let mut rec = self
                .sessions
                .get_mut(&request.session_id)
                .ok_or_else(|| BackendError::SessionNotFound(request.session_id.to_string()))?;
            rec.turn = turn.clone();
            rec.last_activity = Utc::now();
            if let Some(model) = &request.model {
                rec.model = model.clone();
            }
            let invocation = AgentInvocation {
                working_dir: rec.working_dir.clone(),
                prompt: request.message,
                model: rec.model.clone(),
                permission_mode: request.permission_mode,
                resume_id: rec.resume_id.clone(),
                system_prompt: rec.system_prompt.clone(),
            };
            (rec.native_id.clone(), invocation)
        };
        let stream = self.runtime.run(invocation, turn).await?;
        Ok(self.wrap(request.session_id, native_id, stream))
    }

    async fn stop_session(&self, session_id: &SessionId) -> Result<(), BackendError> {
        if let Some((_, rec)) = self.sessions.remove(session_id) {
            rec.turn.cancel();
        }
        Ok(())
    }

    async fn interrupt_session(&self, session_id: &SessionId) -> Result<(), BackendError> {
        if let Some(rec) = self.sessions.get(session_id) {
            rec.turn.cancel();
        }
        Ok(())
    }

    async fn answer_question(
        &self,
        _session_id: &SessionId,
        _answers: &HashMap<String, String>,
    ) -> Result<bool, BackendError> {
        // print mode has no channel for out-of-band answers
        Ok(false)
    }

    async fn approve_plan(&self, _session_id: &SessionId, _decision: &PlanDecision) -> Result<bool, BackendError> {
        Ok(false)
    }

    async fn read_file_from_agent(&self, session_id: &SessionId, path: &str) -> Result<Option<String>, BackendError> {
        let Some(dir) = self.sessions.get(session_id).map(|r| r.working_dir.clone()) else {
            return Ok(None);
        };
        match tokio::fs::read_to_string(resolve(&dir, path)).await {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn container_state(&self, _working_dir: &str) -> Result<ContainerState, BackendError> {
        Ok(ContainerState::not_applicable())
    }

    async fn terminate_session(&self, working_dir: &str) -> Result<(), BackendError> {
        self.sessions.retain(|_, rec| {
            if rec.working_dir == working_dir {
                rec.turn.cancel();
                false
            } else {
                true
            }
        });
        Ok(())
    }

    async fn list_sessions(&self) -> Result<Vec<BackendSessionSummary>, BackendError> {
        Ok(self
            .sessions
            .iter()
            .map(|s| BackendSessionSummary {
                session_id: s.key().clone(),
                native_session_id: Some(s.native_id.clone()),
                working_dir: s.working_dir.clone(),
                created_at: s.created_at,
                last_activity: s.last_activity,
            })
            .collect())
    }

    async fn cleanup_orphans(&self) -> Result<usize, BackendError> {
        Ok(0)
    }
}
