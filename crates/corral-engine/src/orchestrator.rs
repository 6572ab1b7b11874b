//! Session orchestrator: owns every session's state machine and exposes the
//! public lifecycle operations. Turn processing lives in [`crate::turn`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use corral_core::backend::{BackendKind, ContainerState, ExecutionBackend, PlanDecision};
use corral_core::collaborators::{
    HookRunner, MessageCache, SessionBroadcaster, SessionEvent, SessionMetadata, SessionMetadataStore,
};
use corral_core::content::Message;
use corral_core::ids::SessionId;
use corral_core::session::{PermissionMode, Session, SessionMode, SessionStatus};
use corral_settings::CorralSettings;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::collaborators::{CommandHooks, InMemoryMessageCache, InMemoryMetadataStore, NoopHooks};
use crate::error::EngineError;
use crate::plan::{self, CapturedPlan, PlanMatcher};
use crate::question;
use crate::turn::TurnRequest;

/// The external services the orchestrator reports to.
#[derive(Clone)]
pub struct Collaborators {
    pub hooks: Arc<dyn HookRunner>,
    pub metadata: Arc<dyn SessionMetadataStore>,
    pub messages: Arc<dyn MessageCache>,
    pub broadcaster: Arc<dyn SessionBroadcaster>,
}

impl Collaborators {
    /// In-memory stores and no hooks.
    pub fn in_memory(broadcaster: Arc<dyn SessionBroadcaster>) -> Self {
        Self {
            hooks: Arc::new(NoopHooks),
            metadata: Arc::new(InMemoryMetadataStore::new()),
            messages: Arc::new(InMemoryMessageCache::new()),
            broadcaster,
        }
    }

    /// In-memory stores, with the configured session-start hook commands.
    pub fn from_settings(settings: &CorralSettings, broadcaster: Arc<dyn SessionBroadcaster>) -> Self {
        let mut collaborators = Self::in_memory(broadcaster);
        if !settings.hooks.session_start.is_empty() {
            collaborators.hooks = Arc::new(CommandHooks::from_settings(&settings.hooks));
        }
        collaborators
    }
}

#[derive(Clone, Debug, Default)]
pub struct StartOptions {
    pub entity_id: String,
    pub project_id: String,
    pub working_dir: String,
    /// Falls back to resume metadata, then build mode.
    pub mode: Option<SessionMode>,
    /// Falls back to resume metadata, then the configured default model.
    pub model: Option<String>,
    pub system_prompt: Option<String>,
    /// Backend-native conversation to resume.
    pub resume_id: Option<String>,
}

/// Per-session state the orchestrator keeps next to the [`Session`] record.
pub(crate) struct SessionHandle {
    pub(crate) id: SessionId,
    pub(crate) session: Mutex<Session>,
    /// System prompt as supplied by the caller, without hook output.
    pub(crate) user_prompt: Option<String>,
    /// Lives as long as the session.
    pub(crate) scope: CancellationToken,
    /// Child of `scope`; replaced on every interrupt.
    pub(crate) turn: Mutex<CancellationToken>,
    /// Set once the backend announced its session for this id.
    pub(crate) backend_live: AtomicBool,
    /// Turns still reading a backend stream.
    pub(crate) turns_in_flight: AtomicUsize,
    pub(crate) native_id: Mutex<Option<String>>,
    pub(crate) captured_plan: Mutex<Option<CapturedPlan>>,
    pub(crate) tool_names: DashMap<String, String>,
}

impl SessionHandle {
    fn new(session: Session, user_prompt: Option<String>) -> Self {
        let scope = CancellationToken::new();
        let turn = scope.child_token();
        Self {
            id: session.id.clone(),
            session: Mutex::new(session),
            user_prompt,
            scope,
            turn: Mutex::new(turn),
            backend_live: AtomicBool::new(false),
            turns_in_flight: AtomicUsize::new(0),
            native_id: Mutex::new(None),
            captured_plan: Mutex::new(None),
            tool_names: DashMap::new(),
        }
    }

    pub(crate) fn snapshot(&self) -> Session {
        self.session.lock().clone()
    }

    pub(crate) fn turn_token(&self) -> CancellationToken {
        self.turn.lock().clone()
    }

    /// Cancel the in-flight turn and install a fresh scope for the next one.
    pub(crate) fn replace_turn(&self) {
        let old = std::mem::replace(&mut *self.turn.lock(), self.scope.child_token());
        old.cancel();
    }

    pub(crate) fn forget_backend(&self) {
        self.backend_live.store(false, Ordering::SeqCst);
        *self.native_id.lock() = None;
    }
}

pub struct Orchestrator {
    pub(crate) backend: Arc<dyn ExecutionBackend>,
    pub(crate) hooks: Arc<dyn HookRunner>,
    pub(crate) metadata: Arc<dyn SessionMetadataStore>,
    pub(crate) cache: Arc<dyn MessageCache>,
    pub(crate) broadcaster: Arc<dyn SessionBroadcaster>,
    pub(crate) plans: PlanMatcher,
    default_model: String,
    sessions: DashMap<SessionId, Arc<SessionHandle>>,
}

impl Orchestrator {
    pub fn new(backend: Arc<dyn ExecutionBackend>, collaborators: Collaborators) -> Self {
        Self {
            backend,
            hooks: collaborators.hooks,
            metadata: collaborators.metadata,
            cache: collaborators.messages,
            broadcaster: collaborators.broadcaster,
            plans: PlanMatcher::default(),
            default_model: "sonnet".to_string(),
            sessions: DashMap::new(),
        }
    }

    pub fn from_settings(
        backend: Arc<dyn ExecutionBackend>,
        collaborators: Collaborators,
        settings: &CorralSettings,
    ) -> Self {
        Self::new(backend, collaborators)
            .with_plan_matcher(PlanMatcher::from_settings(&settings.plans))
            .with_default_model(settings.backend.default_model.clone())
    }

    pub fn with_plan_matcher(mut self, plans: PlanMatcher) -> Self {
        self.plans = plans;
        self
    }

    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = model.into();
        self
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    pub(crate) fn handle(&self, session_id: &SessionId) -> Result<Arc<SessionHandle>, EngineError> {
        self.sessions
            .get(session_id)
            .map(|h| h.clone())
            .ok_or_else(|| EngineError::SessionNotFound(session_id.to_string()))
    }

    pub(crate) fn publish(&self, event: SessionEvent) {
        self.broadcaster.publish(event);
    }

    /// Mutate the session under its lock, publishing a status change if `f`
    /// made one.
    pub(crate) fn update<R>(&self, handle: &SessionHandle, f: impl FnOnce(&mut Session) -> R) -> R {
        let (result, changed) = {
            let mut session = handle.session.lock();
            let before = session.status();
            let result = f(&mut session);
            let changed = (session.status() != before).then(|| (session.status(), session.error.clone()));
            (result, changed)
        };
        if let Some((status, error)) = changed {
            tracing::debug!(session_id = %handle.id, status = status.as_str(), "status changed");
            self.publish(SessionEvent::StatusChanged { session_id: handle.id.clone(), status, error });
        }
        result
    }

    pub(crate) async fn save_metadata(&self, handle: &SessionHandle) {
        let metadata = {
            let s = handle.session.lock();
            let Some(native) = s.resume_id.clone() else { return };
            SessionMetadata {
                native_session_id: native,
                session_id: s.id.clone(),
                working_dir: s.working_dir.clone(),
                model: s.model.clone(),
                mode: s.mode,
                system_prompt: handle.user_prompt.clone(),
            }
        };
        if let Err(e) = self.metadata.save(metadata).await {
            tracing::warn!(session_id = %handle.id, error = %e, "failed to save resume metadata");
        }
    }

    async fn run_hooks(&self, working_dir: &str) -> Option<String> {
        match self.hooks.execute_session_start_hooks(working_dir).await {
            Ok(outputs) => {
                let texts: Vec<String> = outputs
                    .into_iter()
                    .filter(|o| o.success && !o.output.trim().is_empty())
                    .map(|o| o.output.trim().to_string())
                    .collect();
                (!texts.is_empty()).then(|| texts.join("\n\n"))
            }
            Err(e) => {
                tracing::warn!(working_dir, error = %e, "session start hooks failed, continuing without their output");
                None
            }
        }
    }

    /// Allocate a session, run its start hooks and make it ready for input.
    #[instrument(skip_all, fields(working_dir = %options.working_dir))]
    pub async fn start_session(&self, options: StartOptions) -> Result<Session, EngineError> {
        let seed = match &options.resume_id {
            Some(native) => match self.metadata.get(native).await {
                Ok(found) => found,
                Err(e) => {
                    tracing::warn!(resume_id = %native, error = %e, "resume metadata lookup failed");
                    None
                }
            },
            None => None,
        };
        let model = options
            .model
            .filter(|m| !m.trim().is_empty())
            .or_else(|| seed.as_ref().map(|m| m.model.clone()))
            .unwrap_or_else(|| self.default_model.clone());
        let mode = options.mode.or(seed.as_ref().map(|m| m.mode)).unwrap_or_default();
        let user_prompt = options.system_prompt.or_else(|| seed.and_then(|m| m.system_prompt));

        let mut session = Session::new(options.entity_id, options.project_id, options.working_dir.clone(), mode, model);
        session.resume_id = options.resume_id;
        let handle = Arc::new(SessionHandle::new(session, user_prompt.clone()));
        let id = handle.id.clone();
        self.sessions.insert(id.clone(), handle.clone());

        self.update(&handle, |s| s.transition(SessionStatus::RunningHooks));
        let hook_text = self.run_hooks(&options.working_dir).await;
        handle.session.lock().system_prompt = compose_system_prompt(hook_text, user_prompt);

        if let Err(e) = self.cache.initialize(&id).await {
            tracing::warn!(session_id = %id, error = %e, "failed to initialize message cache");
        }
        self.save_metadata(&handle).await;

        self.update(&handle, |s| s.transition(SessionStatus::WaitingForInput));
        self.publish(SessionEvent::Started { session_id: id.clone(), working_dir: options.working_dir });
        tracing::info!(session_id = %id, backend = %self.backend.kind(), "session started");
        Ok(handle.snapshot())
    }

    /// Run one user turn to completion.
    #[instrument(skip_all, fields(session_id = %session_id))]
    pub async fn send_message(
        &self,
        session_id: &SessionId,
        text: &str,
        permission_mode: PermissionMode,
        model: Option<String>,
    ) -> Result<(), EngineError> {
        let handle = self.handle(session_id)?;
        let revive = self.update(&handle, |s| {
            let status = s.status();
            if !status.accepts_message() {
                return Err(EngineError::InvalidState { operation: "send a message", status });
            }
            s.pending_question = None;
            s.transition(SessionStatus::Running);
            Ok(status == SessionStatus::Error)
        })?;
        self.drive_turn(&handle, TurnRequest { text: text.to_string(), permission_mode, model, revive })
            .await
    }

    /// Answer the pending question. The question and the waiting status are
    /// cleared before the backend is contacted.
    #[instrument(skip_all, fields(session_id = %session_id))]
    pub async fn answer_question(
        &self,
        session_id: &SessionId,
        answers: HashMap<String, String>,
    ) -> Result<(), EngineError> {
        let handle = self.handle(session_id)?;
        let asked = self.update(&handle, |s| {
            let status = s.status();
            if status != SessionStatus::WaitingForQuestionAnswer {
                return Err(EngineError::InvalidState { operation: "answer a question", status });
            }
            let asked = s.pending_question.take();
            s.transition(SessionStatus::Running);
            Ok(asked)
        })?;

        match self.backend.answer_question(session_id, &answers).await {
            Ok(true) => {
                tracing::debug!("answer delivered to the running turn");
                return Ok(());
            }
            Ok(false) => {}
            Err(e) => tracing::warn!(error = %e, "out-of-band answer failed, sending it as a message"),
        }
        self.supersede_turn(&handle).await;
        let permission_mode = handle.session.lock().mode.default_permission();
        let text = question::format_answers(asked.as_ref(), &answers);
        self.drive_turn(&handle, TurnRequest { text, permission_mode, model: None, revive: false }).await
    }

    /// Start the next turn in a fresh backend conversation. History stays.
    #[instrument(skip_all, fields(session_id = %session_id))]
    pub async fn clear_context(&self, session_id: &SessionId) -> Result<(), EngineError> {
        let handle = self.handle(session_id)?;
        let status = handle.session.lock().status();
        if status == SessionStatus::Running {
            return Err(EngineError::InvalidState { operation: "clear context", status });
        }
        self.reset_conversation(&handle).await;
        Ok(())
    }

    pub(crate) async fn reset_conversation(&self, handle: &SessionHandle) {
        handle.replace_turn();
        handle.session.lock().clear_context();
        self.forget_backend_session(handle).await;
        tracing::info!(session_id = %handle.id, "context cleared");
    }

    /// Cancel a turn that is still reading its stream so a resubmission
    /// becomes the session's only turn.
    pub(crate) async fn supersede_turn(&self, handle: &SessionHandle) {
        handle.replace_turn();
        if handle.turns_in_flight.load(Ordering::SeqCst) == 0 || !handle.backend_live.load(Ordering::SeqCst) {
            return;
        }
        tracing::debug!(session_id = %handle.id, "interrupting the open turn before resubmitting");
        if let Err(e) = self.backend.interrupt_session(&handle.id).await {
            tracing::warn!(session_id = %handle.id, error = %e, "backend interrupt failed");
        }
    }

    pub(crate) async fn forget_backend_session(&self, handle: &SessionHandle) {
        handle.forget_backend();
        if let Err(e) = self.backend.stop_session(&handle.id).await {
            tracing::warn!(session_id = %handle.id, error = %e, "failed to drop backend session");
        }
    }

    /// Resubmit the stored plan inline.
    #[instrument(skip_all, fields(session_id = %session_id, clear_context))]
    pub async fn execute_plan(&self, session_id: &SessionId, clear_context: bool) -> Result<(), EngineError> {
        let handle = self.handle(session_id)?;
        let (plan, was_error) = self.update(&handle, |s| {
            let status = s.status();
            if !matches!(
                status,
                SessionStatus::WaitingForPlanExecution | SessionStatus::WaitingForInput | SessionStatus::Error
            ) {
                return Err(EngineError::InvalidState { operation: "execute a plan", status });
            }
            let plan = stored_plan(s).ok_or_else(|| EngineError::NoPlan(s.id.to_string()))?;
            s.transition(SessionStatus::Running);
            Ok((plan, status == SessionStatus::Error))
        })?;
        self.run_plan(&handle, &plan, clear_context, was_error).await
    }

    async fn run_plan(&self, handle: &SessionHandle, plan: &str, clear: bool, revive: bool) -> Result<(), EngineError> {
        if clear {
            self.reset_conversation(handle).await;
        }
        handle.session.lock().mode = SessionMode::Build;
        let request = TurnRequest {
            text: plan::execution_message(plan),
            permission_mode: SessionMode::Build.default_permission(),
            model: None,
            revive: revive && !clear,
        };
        self.drive_turn(handle, request).await
    }

    async fn deliver_decision(&self, session_id: &SessionId, decision: &PlanDecision) -> bool {
        match self.backend.approve_plan(session_id, decision).await {
            Ok(resolved) => resolved,
            Err(e) => {
                tracing::warn!(error = %e, "out-of-band plan decision failed, sending it as a message");
                false
            }
        }
    }

    /// Review the pending plan.
    #[instrument(skip_all, fields(session_id = %session_id, approved, keep_context))]
    pub async fn approve_plan(
        &self,
        session_id: &SessionId,
        approved: bool,
        keep_context: bool,
        feedback: Option<String>,
    ) -> Result<(), EngineError> {
        let handle = self.handle(session_id)?;
        let plan = self.update(&handle, |s| {
            let status = s.status();
            if status != SessionStatus::WaitingForPlanExecution {
                return Err(EngineError::InvalidState { operation: "review a plan", status });
            }
            let plan = stored_plan(s);
            if approved && !keep_context && plan.is_none() {
                return Err(EngineError::NoPlan(s.id.to_string()));
            }
            s.transition(SessionStatus::Running);
            Ok(plan)
        })?;

        if approved && !keep_context {
            return match plan {
                Some(plan) => self.run_plan(&handle, &plan, true, false).await,
                None => Err(EngineError::NoPlan(session_id.to_string())),
            };
        }

        let decision = PlanDecision { approved, keep_context, feedback: feedback.clone() };
        if self.deliver_decision(session_id, &decision).await {
            if approved {
                handle.session.lock().mode = SessionMode::Build;
            }
            tracing::debug!("plan decision delivered to the running turn");
            return Ok(());
        }
        self.supersede_turn(&handle).await;

        if approved {
            return match plan {
                Some(plan) => self.run_plan(&handle, &plan, false, false).await,
                None => {
                    handle.session.lock().mode = SessionMode::Build;
                    let request = TurnRequest {
                        text: plan::approval_message(),
                        permission_mode: SessionMode::Build.default_permission(),
                        model: None,
                        revive: false,
                    };
                    self.drive_turn(&handle, request).await
                }
            };
        }
        let request = TurnRequest {
            text: plan::revision_message(feedback.as_deref()),
            permission_mode: PermissionMode::Plan,
            model: None,
            revive: false,
        };
        self.drive_turn(&handle, request).await
    }

    /// Cancel everything and drop the session from the active set.
    #[instrument(skip_all, fields(session_id = %session_id))]
    pub async fn stop_session(&self, session_id: &SessionId) -> Result<Session, EngineError> {
        let (_, handle) = self
            .sessions
            .remove(session_id)
            .ok_or_else(|| EngineError::SessionNotFound(session_id.to_string()))?;
        self.update(&handle, |s| {
            s.pending_question = None;
            s.transition(SessionStatus::Stopped)
        });
        handle.scope.cancel();
        if let Err(e) = self.backend.stop_session(session_id).await {
            tracing::warn!(error = %e, "backend stop failed");
        }
        self.publish(SessionEvent::Stopped { session_id: session_id.clone() });
        tracing::info!("session stopped");
        Ok(handle.snapshot())
    }

    /// Abort the in-flight turn; the backend conversation stays usable.
    #[instrument(skip_all, fields(session_id = %session_id))]
    pub async fn interrupt_session(&self, session_id: &SessionId) -> Result<(), EngineError> {
        let handle = self.handle(session_id)?;
        self.update(&handle, |s| {
            if matches!(
                s.status(),
                SessionStatus::Running | SessionStatus::WaitingForQuestionAnswer | SessionStatus::WaitingForPlanExecution
            ) {
                s.pending_question = None;
                s.transition(SessionStatus::WaitingForInput);
            }
        });
        handle.replace_turn();
        if let Err(e) = self.backend.interrupt_session(session_id).await {
            tracing::warn!(error = %e, "backend interrupt failed");
        }
        tracing::info!("session interrupted");
        Ok(())
    }

    pub fn get_session(&self, session_id: &SessionId) -> Option<Session> {
        self.sessions.get(session_id).map(|h| h.snapshot())
    }

    pub fn list_sessions(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = self.sessions.iter().map(|h| h.snapshot()).collect();
        sessions.sort_by_key(|s| s.created_at);
        sessions
    }

    /// Message history, from the cache when it has one.
    pub async fn messages(&self, session_id: &SessionId) -> Result<Vec<Message>, EngineError> {
        match self.cache.list(session_id).await {
            Ok(messages) => Ok(messages),
            Err(e) => {
                tracing::debug!(session_id = %session_id, error = %e, "message cache miss");
                Ok(self.handle(session_id)?.snapshot().messages)
            }
        }
    }

    pub async fn container_state(&self, working_dir: &str) -> Result<ContainerState, EngineError> {
        Ok(self.backend.container_state(working_dir).await?)
    }

    /// Stop every session in `working_dir`, then tear down its execution unit.
    pub async fn terminate_unit(&self, working_dir: &str) -> Result<(), EngineError> {
        let ids: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|h| h.session.lock().working_dir == working_dir)
            .map(|h| h.id.clone())
            .collect();
        for id in ids {
            self.stop_session(&id).await?;
        }
        Ok(self.backend.terminate_session(working_dir).await?)
    }

    pub async fn cleanup_orphans(&self) -> Result<usize, EngineError> {
        Ok(self.backend.cleanup_orphans().await?)
    }
}

fn stored_plan(session: &Session) -> Option<String> {
    session.plan.as_ref().map(|p| p.content.clone()).filter(|c| !c.trim().is_empty())
}

/// Hook output goes ahead of the caller's system prompt.
pub fn compose_system_prompt(hook_text: Option<String>, user_prompt: Option<String>) -> Option<String> {
    let parts: Vec<String> = [hook_text, user_prompt.filter(|p| !p.trim().is_empty())].into_iter().flatten().collect();
    (!parts.is_empty()).then(|| parts.join("\n\n"))
}
