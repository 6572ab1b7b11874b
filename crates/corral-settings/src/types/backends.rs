//! Per-backend settings: local runtime, docker containers, cloud apps.

use serde::{Deserialize, Serialize};

/// Credential and identity variables passed into locally spawned containers.
const DEFAULT_DOCKER_ENV: &[&str] = &[
    "ANTHROPIC_API_KEY",
    "CLAUDE_CODE_OAUTH_TOKEN",
    "GITHUB_TOKEN",
    "GH_TOKEN",
    "GIT_AUTHOR_NAME",
    "GIT_AUTHOR_EMAIL",
    "GIT_COMMITTER_NAME",
    "GIT_COMMITTER_EMAIL",
];

/// Variables forwarded to cloud apps. Values are read from the host with
/// [`CloudSettings::env_prefix`] prepended, so the remote identity can differ
/// from the local one.
const DEFAULT_CLOUD_ENV: &[&str] = &["ANTHROPIC_API_KEY", "CLAUDE_CODE_OAUTH_TOKEN", "GITHUB_TOKEN"];

fn owned(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| (*s).to_string()).collect()
}

/// In-process agent runtime.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LocalSettings {
    /// Agent CLI executable.
    pub agent_binary: String,
    /// Extra arguments appended to every invocation.
    pub extra_args: Vec<String>,
}

impl Default for LocalSettings {
    fn default() -> Self {
        Self {
            agent_binary: "claude".to_string(),
            extra_args: Vec::new(),
        }
    }
}

/// Locally spawned worker containers.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DockerSettings {
    /// Container runtime CLI.
    pub runtime_binary: String,
    /// Worker image.
    pub image: String,
    /// Port the worker listens on inside the container.
    pub worker_port: u16,
    /// Network to attach; the runtime default when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    /// Prefix of every managed container name.
    pub name_prefix: String,
    /// State directory created next to the workspace.
    pub state_dir_name: String,
    /// Mount points inside the container.
    pub workspace_mount: String,
    pub state_mount: String,
    /// Host variables passed through when set.
    pub env_allow_list: Vec<String>,
    /// Health probe budget: attempts with a fixed delay between them.
    pub health_attempts: u32,
    pub health_delay_ms: u64,
    /// Lines of container log captured when startup fails.
    pub log_tail_lines: u32,
    /// Share the host runtime socket with the container.
    pub mount_runtime_socket: bool,
    /// Remove the container when its last session stops instead of keeping
    /// it for reuse.
    pub teardown_on_stop: bool,
}

impl Default for DockerSettings {
    fn default() -> Self {
        Self {
            runtime_binary: "docker".to_string(),
            image: "corral-worker:latest".to_string(),
            worker_port: 8420,
            network: None,
            name_prefix: "corral-agent".to_string(),
            state_dir_name: ".corral-state".to_string(),
            workspace_mount: "/workspace".to_string(),
            state_mount: "/state".to_string(),
            env_allow_list: owned(DEFAULT_DOCKER_ENV),
            health_attempts: 30,
            health_delay_ms: 1000,
            log_tail_lines: 50,
            mount_runtime_socket: false,
            teardown_on_stop: false,
        }
    }
}

/// Cloud-provisioned worker apps.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CloudSettings {
    /// Control-plane API base URL.
    pub control_plane_url: String,
    /// Environment variable holding the control-plane API token.
    pub api_token_env: String,
    /// Prefix of every managed app name.
    pub app_prefix: String,
    pub region: String,
    pub image: String,
    pub worker_port: u16,
    pub env_allow_list: Vec<String>,
    /// Host-side prefix for allow-listed variables.
    pub env_prefix: String,
    /// Upper bound on waiting for a new app to become healthy.
    pub provision_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub teardown_on_stop: bool,
    /// Event dialect the remote worker speaks: `native` or `a2a`.
    pub protocol: String,
}

impl Default for CloudSettings {
    fn default() -> Self {
        Self {
            control_plane_url: "https://api.corral.dev".to_string(),
            api_token_env: "CORRAL_CLOUD_API_TOKEN".to_string(),
            app_prefix: "corral".to_string(),
            region: "iad".to_string(),
            image: "corral-worker:latest".to_string(),
            worker_port: 8420,
            env_allow_list: owned(DEFAULT_CLOUD_ENV),
            env_prefix: "CORRAL_CLOUD_".to_string(),
            provision_timeout_ms: 300_000,
            poll_interval_ms: 2_000,
            teardown_on_stop: false,
            protocol: "native".to_string(),
        }
    }
}
