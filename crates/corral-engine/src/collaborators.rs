//! Concrete collaborators: in-memory stores, a broadcast sink and hook
//! runners.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use corral_core::collaborators::{
    CollaboratorError, HookOutput, HookRunner, MessageCache, SessionBroadcaster, SessionEvent, SessionMetadata,
    SessionMetadataStore,
};
use corral_core::content::Message;
use corral_core::ids::SessionId;
use corral_settings::HookSettings;
use dashmap::DashMap;
use tokio::process::Command;
use tokio::sync::broadcast;

#[derive(Default)]
pub struct InMemoryMetadataStore {
    entries: DashMap<String, SessionMetadata>,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl SessionMetadataStore for InMemoryMetadataStore {
    async fn get(&self, native_session_id: &str) -> Result<Option<SessionMetadata>, CollaboratorError> {
        Ok(self.entries.get(native_session_id).map(|e| e.clone()))
    }

    async fn save(&self, metadata: SessionMetadata) -> Result<(), CollaboratorError> {
        self.entries.insert(metadata.native_session_id.clone(), metadata);
        Ok(())
    }

    async fn remove(&self, native_session_id: &str) -> Result<(), CollaboratorError> {
        self.entries.remove(native_session_id);
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryMessageCache {
    messages: DashMap<SessionId, Vec<Message>>,
}

impl InMemoryMessageCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageCache for InMemoryMessageCache {
    async fn initialize(&self, session_id: &SessionId) -> Result<(), CollaboratorError> {
        self.messages.entry(session_id.clone()).or_default();
        Ok(())
    }

    async fn append(&self, session_id: &SessionId, message: &Message) -> Result<(), CollaboratorError> {
        self.messages.entry(session_id.clone()).or_default().push(message.clone());
        Ok(())
    }

    async fn list(&self, session_id: &SessionId) -> Result<Vec<Message>, CollaboratorError> {
        self.messages
            .get(session_id)
            .map(|m| m.clone())
            .ok_or_else(|| CollaboratorError::new(format!("no cached messages for {session_id}")))
    }
}

/// Broadcast-channel sink. Subscribers that fall behind lose the oldest
/// events.
pub struct ChannelBroadcaster {
    tx: broadcast::Sender<SessionEvent>,
}

impl ChannelBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }
}

impl Default for ChannelBroadcaster {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl SessionBroadcaster for ChannelBroadcaster {
    fn publish(&self, event: SessionEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("no session event receivers, event dropped");
        }
    }
}

pub struct NoopHooks;

#[async_trait]
impl HookRunner for NoopHooks {
    async fn execute_session_start_hooks(&self, _working_dir: &str) -> Result<Vec<HookOutput>, CollaboratorError> {
        Ok(Vec::new())
    }
}

/// Runs each configured shell command in the working directory and
/// collects its stdout.
pub struct CommandHooks {
    commands: Vec<String>,
    timeout: Duration,
}

impl CommandHooks {
    pub fn new(commands: Vec<String>, timeout: Duration) -> Self {
        Self { commands, timeout }
    }

    pub fn from_settings(settings: &HookSettings) -> Self {
        Self::new(settings.session_start.clone(), Duration::from_millis(settings.timeout_ms))
    }

    async fn run_one(&self, command: &str, working_dir: &str) -> Result<HookOutput, CollaboratorError> {
        let child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CollaboratorError::new(format!("failed to spawn hook `{command}`: {e}")))?;

        match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(out)) => {
                if !out.status.success() {
                    tracing::warn!(
                        command,
                        status = %out.status,
                        stderr = %String::from_utf8_lossy(&out.stderr).trim(),
                        "session start hook failed"
                    );
                }
                Ok(HookOutput {
                    success: out.status.success(),
                    output: String::from_utf8_lossy(&out.stdout).trim().to_string(),
                })
            }
            Ok(Err(e)) => Err(CollaboratorError::new(format!("hook `{command}`: {e}"))),
            Err(_) => {
                tracing::warn!(command, timeout_ms = self.timeout.as_millis() as u64, "session start hook timed out");
                Ok(HookOutput { success: false, output: String::new() })
            }
        }
    }
}

#[async_trait]
impl HookRunner for CommandHooks {
    async fn execute_session_start_hooks(&self, working_dir: &str) -> Result<Vec<HookOutput>, CollaboratorError> {
        let mut outputs = Vec::with_capacity(self.commands.len());
        for command in &self.commands {
            outputs.push(self.run_one(command, working_dir).await?);
        }
        Ok(outputs)
    }
}
