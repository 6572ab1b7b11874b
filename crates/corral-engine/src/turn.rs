//! One turn: open the backend stream, consume it in order, settle the
//! session.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};

use corral_core::backend::{BackendEvent, EventStream, MessageRequest, StartRequest};
use corral_core::collaborators::SessionEvent;
use corral_core::content::{ContentBlock, Message, Role};
use corral_core::errors::BackendError;
use corral_core::messages::{AgentMessage, RawStreamEvent, UserContent, WireBlock};
use corral_core::session::{PendingPlan, PendingQuestion, PermissionMode, SessionStatus};
use corral_stream::ContentAssembler;
use futures::StreamExt;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::EngineError;
use crate::orchestrator::{Orchestrator, SessionHandle};
use crate::plan::{self, PlanSources};
use crate::question;

pub(crate) struct TurnRequest {
    pub text: String,
    pub permission_mode: PermissionMode,
    pub model: Option<String>,
    /// The session was in `Error`; drop the backend session first.
    pub revive: bool,
}

enum TurnEnd {
    Completed,
    Cancelled,
}

/// Counts a turn as in flight until dropped.
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct TurnState {
    assembler: ContentAssembler,
    /// Tool-use ids already dispatched, whichever path saw them first.
    handled_tools: HashSet<String>,
    /// Wire ids of complete assistant messages received.
    recorded: HashSet<String>,
    /// Assistant messages kept from the stream alone.
    streamed_only: HashSet<String>,
    saw_result: bool,
    failure: Option<String>,
}

impl Orchestrator {
    /// Push the user message, run the backend turn and settle the status.
    /// Cancellation (interrupt or stop) ends the turn quietly, and a session
    /// that already left Running opens no turn at all.
    pub(crate) async fn drive_turn(&self, handle: &SessionHandle, request: TurnRequest) -> Result<(), EngineError> {
        let cancel = handle.turn_token();
        let user = Message::user_text(&request.text);
        let proceed = self.update(handle, |s| {
            if s.status() != SessionStatus::Running {
                return false;
            }
            if let Some(model) = &request.model {
                s.model = model.clone();
            }
            s.push_message(user.clone());
            true
        });
        if !proceed {
            tracing::debug!(session_id = %handle.id, "session left Running before the turn opened");
            return Ok(());
        }
        let _in_flight = InFlight::enter(&handle.turns_in_flight);
        self.announce(handle, user).await;
        if request.revive {
            tracing::info!(session_id = %handle.id, "reviving session after error");
            self.forget_backend_session(handle).await;
        }

        let stream = match self.open_stream(handle, &request, cancel.clone()).await {
            Ok(stream) => stream,
            Err(_) if cancel.is_cancelled() => return Ok(()),
            Err(e) => return Err(self.fail_turn(handle, e.into())),
        };

        let mut turn = TurnState::default();
        match self.consume(handle, &mut turn, stream, &cancel).await {
            Ok(TurnEnd::Cancelled) => {
                tracing::debug!(session_id = %handle.id, "turn cancelled");
                Ok(())
            }
            Ok(TurnEnd::Completed) => {
                if let Some(failure) = turn.failure {
                    return Err(self.fail_turn(handle, EngineError::Agent(failure)));
                }
                self.update(handle, |s| s.transition_from(SessionStatus::Running, SessionStatus::WaitingForInput));
                Ok(())
            }
            Err(_) if cancel.is_cancelled() => Ok(()),
            Err(e) => Err(self.fail_turn(handle, e)),
        }
    }

    async fn open_stream(
        &self,
        handle: &SessionHandle,
        request: &TurnRequest,
        cancel: CancellationToken,
    ) -> Result<EventStream, BackendError> {
        if handle.backend_live.load(Ordering::SeqCst) {
            let follow_up = MessageRequest {
                session_id: handle.id.clone(),
                message: request.text.clone(),
                model: request.model.clone(),
                permission_mode: request.permission_mode,
                cancel: cancel.clone(),
            };
            match self.backend.send_message(follow_up).await {
                Err(BackendError::SessionNotFound(reason)) => {
                    tracing::warn!(session_id = %handle.id, reason, "backend lost the session, starting a new one");
                    handle.forget_backend();
                }
                other => return other,
            }
        }

        let start = {
            let s = handle.session.lock();
            StartRequest {
                session_id: s.id.clone(),
                working_dir: s.working_dir.clone(),
                mode: s.mode,
                model: s.model.clone(),
                prompt: request.text.clone(),
                system_prompt: s.system_prompt.clone(),
                resume_id: s.resume_id.clone(),
                permission_mode: request.permission_mode,
                cancel,
            }
        };
        self.backend.start_session(start).await
    }

    async fn consume(
        &self,
        handle: &SessionHandle,
        turn: &mut TurnState,
        mut stream: EventStream,
        cancel: &CancellationToken,
    ) -> Result<TurnEnd, EngineError> {
        loop {
            let item = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(TurnEnd::Cancelled),
                item = stream.next() => item,
            };
            match item {
                Some(Ok(event)) => {
                    self.handle_event(handle, turn, event).await;
                    if turn.saw_result {
                        return Ok(TurnEnd::Completed);
                    }
                }
                Some(Err(e)) if e.is_cancelled() => return Ok(TurnEnd::Cancelled),
                Some(Err(e)) => return Err(e.into()),
                None => {
                    return Err(BackendError::ConnectionLost("event stream ended before a result".into()).into());
                }
            }
        }
    }

    async fn handle_event(&self, handle: &SessionHandle, turn: &mut TurnState, event: BackendEvent) {
        match event {
            BackendEvent::SessionStarted { native_session_id } => {
                tracing::debug!(session_id = %handle.id, native_session_id, "backend session started");
                *handle.native_id.lock() = Some(native_session_id);
                handle.backend_live.store(true, Ordering::SeqCst);
            }
            BackendEvent::Message(message) => self.handle_message(handle, turn, message).await,
            BackendEvent::QuestionPending(payload) => {
                let pending = question::from_payload(&payload);
                if let Some(q) = &pending {
                    if !q.tool_use_id.is_empty() && !turn.handled_tools.insert(q.tool_use_id.clone()) {
                        return;
                    }
                }
                self.raise_question(handle, pending);
            }
            BackendEvent::PlanPending(payload) => {
                let (tool_use_id, input) = plan::payload_parts(&payload);
                if let Some(id) = &tool_use_id {
                    if !turn.handled_tools.insert(id.clone()) {
                        return;
                    }
                }
                self.raise_plan(handle, tool_use_id, &input).await;
            }
        }
    }

    async fn handle_message(&self, handle: &SessionHandle, turn: &mut TurnState, message: AgentMessage) {
        match message {
            AgentMessage::System(system) => {
                if system.is_init() {
                    if let Some(resume_id) = system.session_id {
                        self.learn_resume_id(handle, resume_id).await;
                    }
                }
            }
            AgentMessage::StreamEvent(envelope) => {
                self.handle_stream_event(handle, turn, envelope.event, envelope.parent_tool_use_id).await;
            }
            AgentMessage::Assistant(envelope) => {
                let streamed = match &envelope.message.id {
                    Some(id) => {
                        turn.recorded.insert(id.clone());
                        turn.streamed_only.contains(id)
                    }
                    None => false,
                };
                let blocks = convert_blocks(handle, &envelope.message.content, None);
                if blocks.is_empty() {
                    return;
                }
                let mut message = Message::assistant(blocks);
                message.parent_tool_use_id = envelope.parent_tool_use_id;
                let tool_uses: Vec<(String, String, Value)> = message
                    .tool_uses()
                    .map(|(id, name, input)| (id.to_string(), name.to_string(), input.clone()))
                    .collect();
                if !streamed {
                    self.append_message(handle, message).await;
                }
                for (id, name, input) in tool_uses {
                    self.on_tool_use(handle, turn, id, name, input).await;
                }
            }
            AgentMessage::User(envelope) => {
                let blocks = match &envelope.message.content {
                    UserContent::Text(text) => vec![ContentBlock::text(text.clone())],
                    UserContent::Blocks(blocks) => convert_blocks(handle, blocks, envelope.tool_use_result.as_ref()),
                };
                if blocks.is_empty() {
                    return;
                }
                let mut message = Message::new(Role::User, blocks);
                message.parent_tool_use_id = envelope.parent_tool_use_id;
                self.append_message(handle, message).await;
            }
            AgentMessage::Result(result) => {
                handle.session.lock().record_usage(result.total_cost_usd, result.duration_ms);
                if let Some(resume_id) = result.session_id.clone() {
                    self.learn_resume_id(handle, resume_id).await;
                }
                if result.is_error {
                    turn.failure = Some(result.result.clone().unwrap_or_else(|| result.subtype.clone()));
                }
                tracing::debug!(
                    session_id = %handle.id,
                    cost_usd = ?result.total_cost_usd,
                    duration_ms = result.duration_ms,
                    num_turns = result.num_turns,
                    "turn result"
                );
                turn.saw_result = true;
            }
        }
    }

    async fn handle_stream_event(
        &self,
        handle: &SessionHandle,
        turn: &mut TurnState,
        event: RawStreamEvent,
        parent_tool_use_id: Option<String>,
    ) {
        let message_id = event.message_id().map(str::to_owned);
        match event {
            RawStreamEvent::MessageStart { .. } => turn.assembler.reset(message_id),
            RawStreamEvent::ContentBlockStart { index, content_block } => {
                turn.assembler.start_block(index, &content_block);
            }
            RawStreamEvent::ContentBlockDelta { index, delta } => {
                if !turn.assembler.apply_delta(index, &delta) {
                    tracing::trace!(index, "delta for unknown block ignored");
                }
            }
            RawStreamEvent::ContentBlockStop { index } => {
                if let Some(ContentBlock::ToolUse { id, name, input }) = turn.assembler.stop_block(index) {
                    handle.tool_names.insert(id.clone(), name.clone());
                    self.on_tool_use(handle, turn, id, name, input).await;
                }
            }
            RawStreamEvent::MessageStop => {
                // keep streamed content no complete assistant message covered
                let covered = turn.assembler.message_id().is_some_and(|id| turn.recorded.contains(id));
                if covered || turn.assembler.is_empty() {
                    turn.assembler.reset(None);
                    return;
                }
                if let Some(id) = turn.assembler.message_id() {
                    turn.streamed_only.insert(id.to_string());
                }
                let mut message = Message::assistant(turn.assembler.take());
                message.parent_tool_use_id = parent_tool_use_id;
                self.append_message(handle, message).await;
            }
            RawStreamEvent::MessageDelta { .. } | RawStreamEvent::Other => {}
        }
    }

    async fn on_tool_use(&self, handle: &SessionHandle, turn: &mut TurnState, id: String, name: String, input: Value) {
        if !turn.handled_tools.insert(id.clone()) {
            return;
        }
        match name.as_str() {
            "AskUserQuestion" => self.raise_question(handle, PendingQuestion::from_tool_input(id, &input)),
            "ExitPlanMode" => self.raise_plan(handle, Some(id), &input).await,
            _ => {
                if let Some(captured) = plan::capture(&self.plans, &name, &input) {
                    tracing::debug!(session_id = %handle.id, path = %captured.path, "captured plan file write");
                    *handle.captured_plan.lock() = Some(captured);
                }
            }
        }
    }

    fn raise_question(&self, handle: &SessionHandle, pending: Option<PendingQuestion>) {
        let Some(pending) = pending else {
            tracing::warn!(session_id = %handle.id, "question without usable entries ignored");
            return;
        };
        let raised = self.update(handle, |s| {
            if s.status() != SessionStatus::Running {
                return false;
            }
            s.pending_question = Some(pending.clone());
            s.transition(SessionStatus::WaitingForQuestionAnswer)
        });
        if raised {
            tracing::info!(session_id = %handle.id, questions = pending.questions.len(), "question pending");
            self.publish(SessionEvent::QuestionReceived { session_id: handle.id.clone(), question: pending });
        }
    }

    async fn raise_plan(&self, handle: &SessionHandle, tool_use_id: Option<String>, input: &Value) {
        let working_dir = handle.session.lock().working_dir.clone();
        let captured = handle.captured_plan.lock().clone();
        let sources = PlanSources {
            input,
            tool_use_id: tool_use_id.clone(),
            captured,
            working_dir: &working_dir,
            default_file_name: self.plans.default_file_name(),
            backend: self.backend.as_ref(),
            session_id: &handle.id,
        };
        let plan = match plan::resolve(sources).await {
            Some(plan) => plan,
            None => {
                tracing::warn!(session_id = %handle.id, "plan proposed but its content could not be found");
                PendingPlan { tool_use_id, content: String::new(), path: None }
            }
        };
        let raised = self.update(handle, |s| {
            if s.status() != SessionStatus::Running {
                return false;
            }
            s.plan = Some(plan.clone());
            s.transition(SessionStatus::WaitingForPlanExecution)
        });
        if raised {
            tracing::info!(session_id = %handle.id, path = ?plan.path, "plan pending review");
            self.publish(SessionEvent::PlanReceived { session_id: handle.id.clone(), plan });
        }
    }

    async fn learn_resume_id(&self, handle: &SessionHandle, resume_id: String) {
        let changed = {
            let mut s = handle.session.lock();
            if s.resume_id.as_deref() == Some(resume_id.as_str()) {
                false
            } else {
                s.resume_id = Some(resume_id);
                true
            }
        };
        if changed {
            self.save_metadata(handle).await;
        }
    }

    pub(crate) async fn append_message(&self, handle: &SessionHandle, message: Message) {
        handle.session.lock().push_message(message.clone());
        self.announce(handle, message).await;
    }

    /// Cache and broadcast a message already in the session's history.
    async fn announce(&self, handle: &SessionHandle, message: Message) {
        if let Err(e) = self.cache.append(&handle.id, &message).await {
            tracing::warn!(session_id = %handle.id, error = %e, "failed to cache message");
        }
        self.publish(SessionEvent::MessageReceived { session_id: handle.id.clone(), message });
    }

    fn fail_turn(&self, handle: &SessionHandle, error: EngineError) -> EngineError {
        let message = error.to_string();
        let failed = self.update(handle, |s| s.fail(message.clone()));
        if failed {
            tracing::error!(session_id = %handle.id, kind = error.error_kind(), error = %message, "turn failed");
        }
        error
    }
}

/// Convert wire blocks, remembering tool names so later results can be
/// parsed by the tool that produced them.
fn convert_blocks(handle: &SessionHandle, blocks: &[WireBlock], structured: Option<&Value>) -> Vec<ContentBlock> {
    for block in blocks {
        if let WireBlock::ToolUse { id, name, .. } = block {
            handle.tool_names.insert(id.clone(), name.clone());
        }
    }
    blocks
        .iter()
        .filter_map(|b| ContentBlock::from_wire(b, |id| handle.tool_names.get(id).map(|n| n.clone()), structured))
        .collect()
}
