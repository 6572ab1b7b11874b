//! Locally spawned worker containers, one per unit of work.
//!
//! Containers are named deterministically from the workspace path so a
//! restarted engine finds (and adopts) the container it created before.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use corral_core::backend::{BackendKind, ContainerState, ContainerStatus};
use corral_core::errors::BackendError;
use corral_settings::DockerSettings;
use dashmap::{DashMap, DashSet};
use sha2::{Digest, Sha256};
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::instrument;

use crate::address::parse_container_address;
use crate::remote::{ExecutionUnit, Provisioner, RemoteBackend};
use crate::worker::WorkerClient;

pub const MANAGED_LABEL: &str = "corral.managed";
pub const UNIT_LABEL: &str = "corral.unit";
const RUNTIME_SOCKET: &str = "/var/run/docker.sock";

pub type DockerBackend = RemoteBackend<DockerProvisioner>;

/// What `inspect` reports about one container.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub running: bool,
    /// Raw address text; see [`parse_container_address`].
    pub address: String,
}

/// Everything needed to create a worker container.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub labels: BTreeMap<String, String>,
    /// (host path, container path)
    pub mounts: Vec<(String, String)>,
    pub env: BTreeMap<String, String>,
    pub network: Option<String>,
}

/// Minimal surface of a container runtime.
#[async_trait]
pub trait ContainerRuntime: Send + Sync + 'static {
    /// `Ok(None)` when no container has that name or id.
    async fn inspect(&self, name: &str) -> Result<Option<ContainerInfo>, BackendError>;
    /// Create and start a container. Returns its id.
    async fn create(&self, spec: &ContainerSpec) -> Result<String, BackendError>;
    async fn stop(&self, id: &str) -> Result<(), BackendError>;
    /// Force-remove, running or not.
    async fn remove(&self, id: &str) -> Result<(), BackendError>;
    /// Running containers carrying the managed label whose name starts with
    /// `prefix`.
    async fn list_managed(&self, prefix: &str) -> Result<Vec<ContainerInfo>, BackendError>;
    async fn logs(&self, id: &str, tail: u32) -> Result<String, BackendError>;
}

/// Drives the runtime CLI (`docker` or a compatible binary).
pub struct DockerCli {
    binary: String,
}

impl DockerCli {
    pub fn new(binary: impl Into<String>) -> Self {
        Self { binary: binary.into() }
    }

    async fn run(&self, args: &[String]) -> Result<std::process::Output, BackendError> {
        tracing::trace!(binary = %self.binary, ?args, "runtime call");
        Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| BackendError::Runtime(format!("failed to run {}: {e}", self.binary)))
    }

    async fn run_ok(&self, args: &[String]) -> Result<String, BackendError> {
        let output = self.run(args).await?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            Err(BackendError::Runtime(format!(
                "{} {} failed: {}",
                self.binary,
                args.first().map(String::as_str).unwrap_or_default(),
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }
}

const INSPECT_FORMAT: &str =
    "{{.Id}}|{{.Name}}|{{.State.Running}}|{{range .NetworkSettings.Networks}}{{.IPAddress}}{{end}}";

/// Parse one `INSPECT_FORMAT` line.
fn parse_inspect_line(line: &str) -> Option<ContainerInfo> {
    let mut parts = line.trim().splitn(4, '|');
    let id = parts.next()?.trim().to_string();
    let name = parts.next()?.trim().trim_start_matches('/').to_string();
    let running = parts.next()?.trim() == "true";
    let address = parts.next().unwrap_or_default().to_string();
    (!id.is_empty()).then_some(ContainerInfo { id, name, running, address })
}

fn strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| (*s).to_string()).collect()
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn inspect(&self, name: &str) -> Result<Option<ContainerInfo>, BackendError> {
        let output = self.run(&strings(&["inspect", "--format", INSPECT_FORMAT, name])).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("No such") || stderr.contains("no such") {
                return Ok(None);
            }
            return Err(BackendError::Runtime(format!("inspect {name} failed: {}", stderr.trim())));
        }
        Ok(String::from_utf8_lossy(&output.stdout).lines().find_map(parse_inspect_line))
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String, BackendError> {
        let mut args = strings(&["run", "-d", "--name", &spec.name]);
        for (k, v) in &spec.labels {
            args.push("--label".into());
            args.push(format!("{k}={v}"));
        }
        for (host, target) in &spec.mounts {
            args.push("-v".into());
            args.push(format!("{host}:{target}"));
        }
        for (k, v) in &spec.env {
            args.push("-e".into());
            args.push(format!("{k}={v}"));
        }
        if let Some(network) = &spec.network {
            args.push("--network".into());
            args.push(network.clone());
        }
        args.push(spec.image.clone());
        self.run_ok(&args).await
    }

    async fn stop(&self, id: &str) -> Result<(), BackendError> {
        self.run_ok(&strings(&["stop", id])).await.map(drop)
    }

    async fn remove(&self, id: &str) -> Result<(), BackendError> {
        self.run_ok(&strings(&["rm", "-f", id])).await.map(drop)
    }

    async fn list_managed(&self, prefix: &str) -> Result<Vec<ContainerInfo>, BackendError> {
        let label = format!("label={MANAGED_LABEL}=true");
        let name = format!("name=^/?{prefix}-");
        let out = self
            .run_ok(&strings(&["ps", "--filter", &label, "--filter", &name, "--format", "{{.ID}}|{{.Names}}|true|"]))
            .await?;
        Ok(out
            .lines()
            .filter_map(parse_inspect_line)
            .filter(|c| c.name.starts_with(prefix))
            .collect())
    }

    async fn logs(&self, id: &str, tail: u32) -> Result<String, BackendError> {
        let output = self.run(&strings(&["logs", "--tail", &tail.to_string(), id])).await?;
        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(text)
    }
}

/// Tracked container for one unit of work.
#[derive(Clone, Debug)]
struct ContainerRecord {
    id: String,
    base_url: String,
}

/// Deterministic container name: prefix, sanitized workspace basename and
/// a short digest of the full path.
pub fn container_name(prefix: &str, working_dir: &str) -> String {
    let base: String = Path::new(working_dir)
        .file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .take(32)
        .collect();
    let digest = Sha256::digest(working_dir.as_bytes());
    let hash: String = digest.iter().take(6).map(|b| format!("{b:02x}")).collect();
    let base = base.trim_matches('-');
    if base.is_empty() {
        format!("{prefix}-{hash}")
    } else {
        format!("{prefix}-{base}-{hash}")
    }
}

/// Persistent state directory next to the workspace.
pub fn state_dir(working_dir: &str, state_dir_name: &str) -> PathBuf {
    let path = Path::new(working_dir);
    let base = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    let parent = path.parent().unwrap_or(path);
    parent.join(format!("{base}{state_dir_name}"))
}

/// Full ids from `run` vs short ids from `ps`.
fn same_container(a: &str, b: &str) -> bool {
    !a.is_empty() && !b.is_empty() && (a.starts_with(b) || b.starts_with(a))
}

pub struct DockerProvisioner {
    runtime: Arc<dyn ContainerRuntime>,
    client: WorkerClient,
    settings: DockerSettings,
    containers: DashMap<String, ContainerRecord>,
    /// Names being created right now; cleanup leaves them alone.
    provisioning: DashSet<String>,
    unit_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl DockerProvisioner {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, client: WorkerClient, settings: DockerSettings) -> Self {
        Self {
            runtime,
            client,
            settings,
            containers: DashMap::new(),
            provisioning: DashSet::new(),
            unit_locks: DashMap::new(),
        }
    }

    pub fn is_tracked(&self, id: &str) -> bool {
        self.containers.iter().any(|r| same_container(&r.id, id))
    }

    fn base_url(&self, address: &str) -> Result<String, BackendError> {
        let ip = parse_container_address(address).map_err(|e| BackendError::StartupFailure(e.to_string()))?;
        Ok(format!("http://{ip}:{}", self.settings.worker_port))
    }

    fn unit_lock(&self, name: &str) -> Arc<Mutex<()>> {
        self.unit_locks.entry(name.to_string()).or_default().clone()
    }

    fn spec(&self, name: &str, working_dir: &str, state: &Path) -> ContainerSpec {
        let mut labels = BTreeMap::new();
        labels.insert(MANAGED_LABEL.to_string(), "true".to_string());
        labels.insert(UNIT_LABEL.to_string(), working_dir.to_string());

        let mut mounts = vec![
            (working_dir.to_string(), self.settings.workspace_mount.clone()),
            (state.to_string_lossy().into_owned(), self.settings.state_mount.clone()),
        ];
        if self.settings.mount_runtime_socket {
            mounts.push((RUNTIME_SOCKET.to_string(), RUNTIME_SOCKET.to_string()));
        }

        let env = self
            .settings
            .env_allow_list
            .iter()
            .filter_map(|key| std::env::var(key).ok().filter(|v| !v.is_empty()).map(|v| (key.clone(), v)))
            .collect();

        ContainerSpec {
            name: name.to_string(),
            image: self.settings.image.clone(),
            labels,
            mounts,
            env,
            network: self.settings.network.clone(),
        }
    }

    /// Capture the log tail, remove the container and build the error.
    async fn startup_failure(&self, id: &str, reason: String) -> BackendError {
        let logs = match self.runtime.logs(id, self.settings.log_tail_lines).await {
            Ok(logs) => logs,
            Err(e) => format!("<logs unavailable: {e}>"),
        };
        tracing::error!(container = id, %reason, logs = %logs, "container failed to start");
        if let Err(e) = self.runtime.remove(id).await {
            tracing::warn!(container = id, error = %e, "failed to remove broken container");
        }
        BackendError::StartupFailure(format!("{reason}\n--- container log ---\n{logs}"))
    }

    /// Adopt the container already carrying `name` when it answers one
    /// health probe; otherwise remove it.
    async fn adopt_or_remove(&self, name: &str) -> Result<Option<ContainerRecord>, BackendError> {
        let Some(info) = self.runtime.inspect(name).await? else {
            return Ok(None);
        };
        if info.running {
            if let Ok(base_url) = self.base_url(&info.address) {
                if self.client.health(&base_url).await {
                    tracing::info!(container = %info.id, name, "adopting running container");
                    return Ok(Some(ContainerRecord { id: info.id, base_url }));
                }
            }
        }
        tracing::info!(container = %info.id, name, running = info.running, "removing stale container");
        self.runtime.remove(&info.id).await?;
        Ok(None)
    }

    async fn create(&self, name: &str, working_dir: &str) -> Result<ContainerRecord, BackendError> {
        let state = state_dir(working_dir, &self.settings.state_dir_name);
        tokio::fs::create_dir_all(&state).await?;

        let id = self
            .runtime
            .create(&self.spec(name, working_dir, &state))
            .await
            .map_err(|e| BackendError::StartupFailure(format!("failed to launch {}: {e}", self.settings.image)))?;
        tracing::info!(container = %id, name, image = %self.settings.image, "container created");

        let address = match self.runtime.inspect(&id).await {
            Ok(Some(info)) => info.address,
            Ok(None) => return Err(self.startup_failure(&id, "container vanished after start".into()).await),
            Err(e) => return Err(self.startup_failure(&id, e.to_string()).await),
        };
        let base_url = match self.base_url(&address) {
            Ok(url) => url,
            Err(e) => return Err(self.startup_failure(&id, format!("address unavailable: {e}")).await),
        };
        let delay = Duration::from_millis(self.settings.health_delay_ms);
        if !self.client.wait_healthy(&base_url, self.settings.health_attempts, delay).await {
            let reason = format!("worker not healthy after {} probes", self.settings.health_attempts);
            return Err(self.startup_failure(&id, reason).await);
        }
        Ok(ContainerRecord { id, base_url })
    }

    async fn provision(&self, name: &str, working_dir: &str) -> Result<ContainerRecord, BackendError> {
        if let Some(record) = self.adopt_or_remove(name).await? {
            return Ok(record);
        }
        self.create(name, working_dir).await
    }
}

#[async_trait]
impl Provisioner for DockerProvisioner {
    fn kind(&self) -> BackendKind {
        BackendKind::Docker
    }

    fn unit_name(&self, working_dir: &str) -> String {
        container_name(&self.settings.name_prefix, working_dir)
    }

    #[instrument(skip(self), fields(backend = "docker"))]
    async fn ensure_unit(&self, working_dir: &str) -> Result<ExecutionUnit, BackendError> {
        let name = self.unit_name(working_dir);
        let lock = self.unit_lock(&name);
        let _guard = lock.lock().await;

        if let Some(record) = self.containers.get(&name).map(|r| r.clone()) {
            if self.client.health(&record.base_url).await {
                return Ok(ExecutionUnit { name, id: record.id, base_url: record.base_url });
            }
            tracing::warn!(container = %record.id, "tracked container unhealthy, replacing");
            self.containers.remove(&name);
        }

        self.provisioning.insert(name.clone());
        let result = self.provision(&name, working_dir).await;
        if let Ok(record) = &result {
            // tracked before the provisioning mark goes away
            self.containers.insert(name.clone(), record.clone());
        }
        self.provisioning.remove(&name);

        let record = result?;
        Ok(ExecutionUnit { name, id: record.id, base_url: record.base_url })
    }

    async fn unit_state(&self, working_dir: &str) -> Result<ContainerState, BackendError> {
        let name = self.unit_name(working_dir);
        let Some(info) = self.runtime.inspect(&name).await? else {
            return Ok(ContainerState::missing(name));
        };
        let address = parse_container_address(&info.address).ok();
        let healthy = match self.containers.get(&name).map(|r| r.base_url.clone()) {
            Some(base) if info.running => self.client.health(&base).await,
            _ => false,
        };
        Ok(ContainerState {
            status: if info.running { ContainerStatus::Running } else { ContainerStatus::Stopped },
            name: Some(name),
            id: Some(info.id),
            address: address.map(|a| a.to_string()),
            healthy,
        })
    }

    #[instrument(skip(self), fields(backend = "docker"))]
    async fn teardown(&self, working_dir: &str) -> Result<(), BackendError> {
        let name = self.unit_name(working_dir);
        let lock = self.unit_lock(&name);
        let _guard = lock.lock().await;
        let target = self.containers.remove(&name).map(|(_, r)| r.id).unwrap_or(name);
        let Err(e) = self.runtime.remove(&target).await else {
            return Ok(());
        };
        if self.runtime.inspect(&target).await?.is_none() {
            tracing::debug!(error = %e, "container already gone");
            return Ok(());
        }
        Err(e)
    }

    #[instrument(skip(self), fields(backend = "docker"))]
    async fn cleanup_orphans(&self) -> Result<usize, BackendError> {
        let listed = self.runtime.list_managed(&self.settings.name_prefix).await?;
        let mut stopped = 0;
        for container in listed {
            if self.is_tracked(&container.id) || self.provisioning.contains(&container.name) {
                continue;
            }
            match self.runtime.stop(&container.id).await {
                Ok(()) => {
                    tracing::info!(container = %container.id, name = %container.name, "stopped orphan container");
                    stopped += 1;
                }
                Err(e) => tracing::warn!(container = %container.id, error = %e, "failed to stop orphan"),
            }
        }
        Ok(stopped)
    }

    fn teardown_on_stop(&self) -> bool {
        self.settings.teardown_on_stop
    }
}
