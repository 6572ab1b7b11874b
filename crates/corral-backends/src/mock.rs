//! Scripted test doubles for the backend contract and its collaborators.
//!
//! `MockBackend` replays one scripted turn per start/message call so the
//! engine can be exercised without an agent. The fakes below it stand in
//! for the container runtime, the cloud control plane, and the agent
//! process.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use corral_core::backend::{
    event_channel, BackendEvent, BackendKind, BackendSessionSummary, ContainerState, EventStream, ExecutionBackend,
    MessageRequest, PlanDecision, StartRequest,
};
use corral_core::errors::BackendError;
use corral_core::ids::SessionId;
use corral_core::messages::{
    AgentMessage, AssistantEnvelope, AssistantPayload, RawStreamEvent, ResultMessage, StreamEventEnvelope, WireBlock,
};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::cloud::{AppInfo, AppSpec, ControlPlane};
use crate::docker::{ContainerInfo, ContainerRuntime, ContainerSpec};
use crate::local::{AgentInvocation, AgentRuntime};

pub fn system_init(resume_id: &str) -> AgentMessage {
    AgentMessage::system_init(resume_id)
}

pub fn assistant(id: &str, content: Vec<WireBlock>) -> AgentMessage {
    AgentMessage::Assistant(AssistantEnvelope {
        message: AssistantPayload { id: Some(id.into()), content, ..Default::default() },
        session_id: None,
        parent_tool_use_id: None,
    })
}

pub fn assistant_text(id: &str, text: &str) -> AgentMessage {
    assistant(id, vec![WireBlock::Text { text: text.into() }])
}

pub fn assistant_tool_use(id: &str, tool_use_id: &str, name: &str, input: Value) -> AgentMessage {
    assistant(id, vec![WireBlock::ToolUse { id: tool_use_id.into(), name: name.into(), input }])
}

pub fn stream_event(event: RawStreamEvent) -> AgentMessage {
    AgentMessage::StreamEvent(StreamEventEnvelope { event, session_id: None, parent_tool_use_id: None })
}

pub fn result_message() -> AgentMessage {
    AgentMessage::Result(ResultMessage::success(None))
}

pub fn result_with(cost_usd: f64, duration_ms: u64) -> AgentMessage {
    let mut result = ResultMessage::success(None);
    result.total_cost_usd = Some(cost_usd);
    result.duration_ms = duration_ms;
    result.num_turns = 1;
    AgentMessage::Result(result)
}

/// One scripted turn.
#[derive(Debug)]
pub enum MockTurn {
    /// Emit the items, then end the stream.
    Events(Vec<Result<BackendEvent, BackendError>>),
    /// Emit the items, then keep the stream open until the turn is cancelled.
    Hang(Vec<Result<BackendEvent, BackendError>>),
    /// Fail the start/message call itself.
    Fail(BackendError),
}

impl MockTurn {
    /// `session-started`, the messages, nothing else.
    pub fn messages(native_id: &str, messages: Vec<AgentMessage>) -> Self {
        let mut items = vec![Ok(BackendEvent::SessionStarted { native_session_id: native_id.into() })];
        items.extend(messages.into_iter().map(|m| Ok(BackendEvent::Message(m))));
        Self::Events(items)
    }

    /// A turn that just completes.
    pub fn completes(native_id: &str) -> Self {
        Self::messages(native_id, vec![system_init(native_id), result_message()])
    }
}

pub struct MockBackend {
    kind: BackendKind,
    turns: Mutex<VecDeque<MockTurn>>,
    starts: Mutex<Vec<StartRequest>>,
    messages: Mutex<Vec<MessageRequest>>,
    answers: Mutex<Vec<(SessionId, HashMap<String, String>)>>,
    decisions: Mutex<Vec<(SessionId, PlanDecision)>>,
    stopped: Mutex<Vec<SessionId>>,
    interrupted: Mutex<Vec<SessionId>>,
    terminated: Mutex<Vec<String>>,
    out_of_band: AtomicBool,
    fail_out_of_band: AtomicBool,
    files: Mutex<HashMap<String, String>>,
    orphans: AtomicUsize,
}

impl MockBackend {
    pub fn new(turns: Vec<MockTurn>) -> Self {
        Self {
            kind: BackendKind::Local,
            turns: Mutex::new(turns.into()),
            starts: Mutex::default(),
            messages: Mutex::default(),
            answers: Mutex::default(),
            decisions: Mutex::default(),
            stopped: Mutex::default(),
            interrupted: Mutex::default(),
            terminated: Mutex::default(),
            out_of_band: AtomicBool::new(false),
            fail_out_of_band: AtomicBool::new(false),
            files: Mutex::default(),
            orphans: AtomicUsize::new(0),
        }
    }

    pub fn with_kind(mut self, kind: BackendKind) -> Self {
        self.kind = kind;
        self
    }

    /// Answers and plan decisions are reported as delivered out-of-band.
    pub fn with_out_of_band(self) -> Self {
        self.out_of_band.store(true, Ordering::SeqCst);
        self
    }

    /// Answers and plan decisions fail at the transport.
    pub fn with_failing_out_of_band(self) -> Self {
        self.fail_out_of_band.store(true, Ordering::SeqCst);
        self
    }

    pub fn with_file(self, path: &str, content: &str) -> Self {
        self.files.lock().insert(path.into(), content.into());
        self
    }

    pub fn with_orphans(self, n: usize) -> Self {
        self.orphans.store(n, Ordering::SeqCst);
        self
    }

    pub fn push_turn(&self, turn: MockTurn) {
        self.turns.lock().push_back(turn);
    }

    pub fn starts(&self) -> Vec<StartRequest> {
        self.starts.lock().clone()
    }

    pub fn messages(&self) -> Vec<MessageRequest> {
        self.messages.lock().clone()
    }

    pub fn answers(&self) -> Vec<(SessionId, HashMap<String, String>)> {
        self.answers.lock().clone()
    }

    pub fn decisions(&self) -> Vec<(SessionId, PlanDecision)> {
        self.decisions.lock().clone()
    }

    pub fn stopped(&self) -> Vec<SessionId> {
        self.stopped.lock().clone()
    }

    pub fn interrupted(&self) -> Vec<SessionId> {
        self.interrupted.lock().clone()
    }

    pub fn terminated(&self) -> Vec<String> {
        self.terminated.lock().clone()
    }

    fn play(&self, cancel: CancellationToken) -> Result<EventStream, BackendError> {
        let turn = self
            .turns
            .lock()
            .pop_front()
            .ok_or_else(|| BackendError::Runtime("mock backend has no scripted turn left".into()))?;
        let (tx, stream) = event_channel();
        match turn {
            MockTurn::Fail(e) => return Err(e),
            MockTurn::Events(items) => {
                for item in items {
                    let _ = tx.send(item);
                }
            }
            MockTurn::Hang(items) => {
                for item in items {
                    let _ = tx.send(item);
                }
                tokio::spawn(async move {
                    cancel.cancelled().await;
                    drop(tx);
                });
            }
        }
        Ok(stream)
    }

    fn out_of_band_reply(&self) -> Result<bool, BackendError> {
        if self.fail_out_of_band.load(Ordering::SeqCst) {
            return Err(BackendError::ConnectionLost("mock transport down".into()));
        }
        Ok(self.out_of_band.load(Ordering::SeqCst))
    }
}

#[async_trait]
impl ExecutionBackend for MockBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    async fn start_session(&self, request: StartRequest) -> Result<EventStream, BackendError> {
        let cancel = request.cancel.clone();
        self.starts.lock().push(request);
        self.play(cancel)
    }

    async fn send_message(&self, request: MessageRequest) -> Result<EventStream, BackendError> {
        let cancel = request.cancel.clone();
        self.messages.lock().push(request);
        self.play(cancel)
    }

    async fn stop_session(&self, session_id: &SessionId) -> Result<(), BackendError> {
        self.stopped.lock().push(session_id.clone());
        Ok(())
    }

    async fn interrupt_session(&self, session_id: &SessionId) -> Result<(), BackendError> {
        self.interrupted.lock().push(session_id.clone());
        Ok(())
    }

    async fn answer_question(
        &self,
        session_id: &SessionId,
        answers: &HashMap<String, String>,
    ) -> Result<bool, BackendError> {
        self.answers.lock().push((session_id.clone(), answers.clone()));
        self.out_of_band_reply()
    }

    async fn approve_plan(&self, session_id: &SessionId, decision: &PlanDecision) -> Result<bool, BackendError> {
        self.decisions.lock().push((session_id.clone(), decision.clone()));
        self.out_of_band_reply()
    }

    async fn read_file_from_agent(&self, _session_id: &SessionId, path: &str) -> Result<Option<String>, BackendError> {
        Ok(self.files.lock().get(path).cloned())
    }

    async fn container_state(&self, _working_dir: &str) -> Result<ContainerState, BackendError> {
        Ok(ContainerState::not_applicable())
    }

    async fn terminate_session(&self, working_dir: &str) -> Result<(), BackendError> {
        self.terminated.lock().push(working_dir.to_string());
        Ok(())
    }

    async fn list_sessions(&self) -> Result<Vec<BackendSessionSummary>, BackendError> {
        let now = Utc::now();
        Ok(self
            .starts
            .lock()
            .iter()
            .filter(|s| !self.stopped.lock().contains(&s.session_id))
            .map(|s| BackendSessionSummary {
                session_id: s.session_id.clone(),
                native_session_id: None,
                working_dir: s.working_dir.clone(),
                created_at: now,
                last_activity: now,
            })
            .collect())
    }

    async fn cleanup_orphans(&self) -> Result<usize, BackendError> {
        Ok(self.orphans.swap(0, Ordering::SeqCst))
    }
}

/// Agent runtime replaying one message list per invocation.
pub struct ScriptedRuntime {
    turns: Mutex<VecDeque<Vec<AgentMessage>>>,
    invocations: Mutex<Vec<AgentInvocation>>,
}

impl ScriptedRuntime {
    pub fn new(turns: Vec<Vec<AgentMessage>>) -> Self {
        Self { turns: Mutex::new(turns.into()), invocations: Mutex::default() }
    }

    pub fn invocations(&self) -> Vec<AgentInvocation> {
        self.invocations.lock().clone()
    }
}

#[async_trait]
impl AgentRuntime for ScriptedRuntime {
    async fn run(&self, invocation: AgentInvocation, _cancel: CancellationToken) -> Result<EventStream, BackendError> {
        self.invocations.lock().push(invocation);
        let turn = self
            .turns
            .lock()
            .pop_front()
            .ok_or_else(|| BackendError::Runtime("no scripted agent turn".into()))?;
        let (tx, stream) = event_channel();
        for msg in turn {
            let _ = tx.send(Ok(BackendEvent::Message(msg)));
        }
        Ok(stream)
    }
}

/// In-memory container runtime. Every container it creates reports the
/// same raw address text.
pub struct FakeContainerRuntime {
    address: String,
    containers: Mutex<BTreeMap<String, ContainerInfo>>,
    created: Mutex<Vec<ContainerSpec>>,
    created_ids: Mutex<Vec<String>>,
    removed: Mutex<Vec<String>>,
    stopped: Mutex<Vec<String>>,
    next_id: AtomicUsize,
    hold: Mutex<Option<Arc<Notify>>>,
    create_signal: Notify,
}

impl FakeContainerRuntime {
    pub fn new(address: &str) -> Self {
        Self {
            address: address.into(),
            containers: Mutex::default(),
            created: Mutex::default(),
            created_ids: Mutex::default(),
            removed: Mutex::default(),
            stopped: Mutex::default(),
            next_id: AtomicUsize::new(1),
            hold: Mutex::default(),
            create_signal: Notify::new(),
        }
    }

    pub fn created(&self) -> Vec<ContainerSpec> {
        self.created.lock().clone()
    }

    pub fn removed(&self) -> Vec<String> {
        self.removed.lock().clone()
    }

    pub fn stopped(&self) -> Vec<String> {
        self.stopped.lock().clone()
    }

    pub fn insert_running(&self, name: &str, id: &str, address: &str) {
        self.containers.lock().insert(
            id.to_string(),
            ContainerInfo { id: id.into(), name: name.into(), running: true, address: address.into() },
        );
    }

    /// The first inspect of a freshly created container blocks until the
    /// returned gate is notified.
    pub fn hold_after_create(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.hold.lock() = Some(gate.clone());
        gate
    }

    pub async fn wait_for_create(&self) {
        self.create_signal.notified().await;
    }

    fn find(&self, key: &str) -> Option<ContainerInfo> {
        self.containers.lock().values().find(|c| c.id == key || c.name == key).cloned()
    }
}

#[async_trait]
impl ContainerRuntime for FakeContainerRuntime {
    async fn inspect(&self, name: &str) -> Result<Option<ContainerInfo>, BackendError> {
        let found = self.find(name);
        if let Some(info) = &found {
            if self.created_ids.lock().contains(&info.id) {
                let gate = self.hold.lock().take();
                if let Some(gate) = gate {
                    gate.notified().await;
                }
            }
        }
        Ok(found)
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String, BackendError> {
        let id = format!("{:064x}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.containers.lock().insert(
            id.clone(),
            ContainerInfo { id: id.clone(), name: spec.name.clone(), running: true, address: self.address.clone() },
        );
        self.created.lock().push(spec.clone());
        self.created_ids.lock().push(id.clone());
        self.create_signal.notify_one();
        Ok(id)
    }

    async fn stop(&self, id: &str) -> Result<(), BackendError> {
        let mut containers = self.containers.lock();
        let c = containers
            .values_mut()
            .find(|c| c.id == id || c.name == id)
            .ok_or_else(|| BackendError::Runtime(format!("No such container: {id}")))?;
        c.running = false;
        self.stopped.lock().push(id.to_string());
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<(), BackendError> {
        let mut containers = self.containers.lock();
        let key = containers
            .values()
            .find(|c| c.id == id || c.name == id)
            .map(|c| c.id.clone())
            .ok_or_else(|| BackendError::Runtime(format!("No such container: {id}")))?;
        containers.remove(&key);
        self.removed.lock().push(id.to_string());
        Ok(())
    }

    async fn list_managed(&self, prefix: &str) -> Result<Vec<ContainerInfo>, BackendError> {
        let prefix = format!("{prefix}-");
        Ok(self
            .containers
            .lock()
            .values()
            .filter(|c| c.running && c.name.starts_with(&prefix))
            .cloned()
            .collect())
    }

    async fn logs(&self, id: &str, _tail: u32) -> Result<String, BackendError> {
        Ok(format!("worker {id} failed to bind"))
    }
}

/// In-memory control plane. New apps become `running` at `worker_url`
/// after a configurable number of polls.
pub struct FakeControlPlane {
    worker_url: String,
    ready_after: usize,
    apps: Mutex<BTreeMap<String, AppInfo>>,
    countdown: Mutex<HashMap<String, usize>>,
    created: Mutex<Vec<AppSpec>>,
    deleted: Mutex<Vec<String>>,
    polls: AtomicUsize,
    next_id: AtomicUsize,
}

impl FakeControlPlane {
    pub fn new(worker_url: impl Into<String>) -> Self {
        Self {
            worker_url: worker_url.into(),
            ready_after: 0,
            apps: Mutex::default(),
            countdown: Mutex::default(),
            created: Mutex::default(),
            deleted: Mutex::default(),
            polls: AtomicUsize::new(0),
            next_id: AtomicUsize::new(1),
        }
    }

    /// `usize::MAX` keeps new apps pending forever.
    pub fn ready_after_polls(mut self, polls: usize) -> Self {
        self.ready_after = polls;
        self
    }

    pub fn insert_app(&self, app: AppInfo) {
        self.apps.lock().insert(app.name.clone(), app);
    }

    pub fn created(&self) -> Vec<AppSpec> {
        self.created.lock().clone()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().clone()
    }

    pub fn polls(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ControlPlane for FakeControlPlane {
    async fn get_app(&self, name: &str) -> Result<Option<AppInfo>, BackendError> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        let mut apps = self.apps.lock();
        let Some(app) = apps.get_mut(name) else { return Ok(None) };
        let mut countdown = self.countdown.lock();
        if let Some(left) = countdown.get_mut(name) {
            *left = left.saturating_sub(1);
            if *left == 0 {
                countdown.remove(name);
                app.state = "running".into();
                app.url = Some(self.worker_url.clone());
            }
        }
        Ok(Some(app.clone()))
    }

    async fn create_app(&self, spec: &AppSpec) -> Result<AppInfo, BackendError> {
        let id = format!("app_{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let app = if self.ready_after == 0 {
            AppInfo { id, name: spec.name.clone(), state: "running".into(), url: Some(self.worker_url.clone()) }
        } else {
            self.countdown.lock().insert(spec.name.clone(), self.ready_after);
            AppInfo { id, name: spec.name.clone(), state: "pending".into(), url: None }
        };
        self.apps.lock().insert(spec.name.clone(), app.clone());
        self.created.lock().push(spec.clone());
        Ok(app)
    }

    async fn delete_app(&self, name: &str) -> Result<(), BackendError> {
        if self.apps.lock().remove(name).is_some() {
            self.deleted.lock().push(name.to_string());
        }
        self.countdown.lock().remove(name);
        Ok(())
    }

    async fn list_apps(&self, prefix: &str) -> Result<Vec<AppInfo>, BackendError> {
        Ok(self.apps.lock().values().filter(|a| a.name.starts_with(prefix)).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn start_request(cancel: CancellationToken) -> StartRequest {
        StartRequest {
            session_id: SessionId::new(),
            working_dir: "/w".into(),
            mode: corral_core::session::SessionMode::Build,
            model: "sonnet".into(),
            prompt: "hi".into(),
            system_prompt: None,
            resume_id: None,
            permission_mode: corral_core::session::PermissionMode::Default,
            cancel,
        }
    }

    #[tokio::test]
    async fn replays_turns_in_order() {
        let backend = MockBackend::new(vec![MockTurn::completes("n1"), MockTurn::Fail(BackendError::Cancelled)]);
        let events: Vec<_> = backend.start_session(start_request(CancellationToken::new())).await.unwrap().collect().await;
        assert_eq!(events.len(), 3);
        assert!(backend.start_session(start_request(CancellationToken::new())).await.is_err());
        assert!(backend.start_session(start_request(CancellationToken::new())).await.is_err());
        assert_eq!(backend.starts().len(), 3);
    }

    #[tokio::test]
    async fn hanging_turn_ends_on_cancel() {
        let backend = MockBackend::new(vec![MockTurn::Hang(vec![])]);
        let cancel = CancellationToken::new();
        let mut stream = backend.start_session(start_request(cancel.clone())).await.unwrap();
        cancel.cancel();
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn control_plane_countdown() {
        let cp = FakeControlPlane::new("http://w").ready_after_polls(2);
        let spec = AppSpec { name: "corral-a".into(), ..Default::default() };
        assert_eq!(cp.create_app(&spec).await.unwrap().state, "pending");
        assert_eq!(cp.get_app("corral-a").await.unwrap().unwrap().state, "pending");
        let app = cp.get_app("corral-a").await.unwrap().unwrap();
        assert!(app.is_running());
        assert_eq!(app.url.as_deref(), Some("http://w"));
    }
}
