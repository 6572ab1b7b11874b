//! Cloud-provisioned worker apps, one per unit of work.
//!
//! Same lifecycle as the docker backend, but units are created through a
//! control-plane API and provisioning is asynchronous: a new app is polled
//! until its worker answers the health endpoint or the provisioning budget
//! runs out.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use corral_core::backend::{BackendKind, ContainerState, ContainerStatus};
use corral_core::errors::BackendError;
use corral_settings::CloudSettings;
use dashmap::{DashMap, DashSet};
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::instrument;

use crate::docker::{container_name, MANAGED_LABEL, UNIT_LABEL};
use crate::remote::{ExecutionUnit, Provisioner, RemoteBackend};
use crate::worker::WorkerClient;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

pub type CloudBackend = RemoteBackend<CloudProvisioner>;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppInfo {
    pub id: String,
    pub name: String,
    /// Control-plane state, e.g. `pending`, `running`, `stopped`.
    pub state: String,
    /// Public worker URL once the app is reachable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl AppInfo {
    pub fn is_running(&self) -> bool {
        self.state == "running"
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppSpec {
    pub name: String,
    pub image: String,
    pub region: String,
    pub internal_port: u16,
    pub env: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
}

/// Remote compute control plane.
#[async_trait]
pub trait ControlPlane: Send + Sync + 'static {
    async fn get_app(&self, name: &str) -> Result<Option<AppInfo>, BackendError>;
    async fn create_app(&self, spec: &AppSpec) -> Result<AppInfo, BackendError>;
    /// Deleting a missing app is not an error.
    async fn delete_app(&self, name: &str) -> Result<(), BackendError>;
    async fn list_apps(&self, prefix: &str) -> Result<Vec<AppInfo>, BackendError>;
}

#[derive(Deserialize)]
struct AppList {
    #[serde(default)]
    apps: Vec<AppInfo>,
}

/// REST control plane authenticated with a bearer token.
pub struct HttpControlPlane {
    client: Client,
    base_url: String,
    token: SecretString,
}

impl HttpControlPlane {
    pub fn new(base_url: impl Into<String>, token: SecretString) -> Self {
        let client = Client::builder().connect_timeout(CONNECT_TIMEOUT).build().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "falling back to default HTTP client");
            Client::new()
        });
        Self { client, base_url: base_url.into().trim_end_matches('/').to_string(), token }
    }

    /// Read the token from the environment variable named in settings.
    pub fn from_settings(settings: &CloudSettings) -> Result<Self, BackendError> {
        let token = std::env::var(&settings.api_token_env)
            .ok()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| BackendError::StartupFailure(format!("{} is not set", settings.api_token_env)))?;
        Ok(Self::new(settings.control_plane_url.clone(), SecretString::from(token)))
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, format!("{}{path}", self.base_url))
            .header("Authorization", format!("Bearer {}", self.token.expose_secret()))
            .header("accept", "application/json")
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<reqwest::Response, BackendError> {
        req.send().await.map_err(|e| BackendError::ConnectionLost(format!("control plane: {e}")))
    }
}

async fn error_for(resp: reqwest::Response) -> BackendError {
    let status = resp.status().as_u16();
    let body = resp.text().await.unwrap_or_default();
    BackendError::from_status(status, body)
}

async fn parse<T: serde::de::DeserializeOwned>(resp: reqwest::Response) -> Result<T, BackendError> {
    if !resp.status().is_success() {
        return Err(error_for(resp).await);
    }
    resp.json().await.map_err(|e| BackendError::Protocol(format!("control plane reply: {e}")))
}

#[async_trait]
impl ControlPlane for HttpControlPlane {
    async fn get_app(&self, name: &str) -> Result<Option<AppInfo>, BackendError> {
        let resp = self.send(self.request(reqwest::Method::GET, &format!("/v1/apps/{name}"))).await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        parse(resp).await.map(Some)
    }

    async fn create_app(&self, spec: &AppSpec) -> Result<AppInfo, BackendError> {
        let resp = self.send(self.request(reqwest::Method::POST, "/v1/apps").json(spec)).await?;
        parse(resp).await
    }

    async fn delete_app(&self, name: &str) -> Result<(), BackendError> {
        let resp = self.send(self.request(reqwest::Method::DELETE, &format!("/v1/apps/{name}"))).await?;
        if resp.status().is_success() || resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        Err(error_for(resp).await)
    }

    async fn list_apps(&self, prefix: &str) -> Result<Vec<AppInfo>, BackendError> {
        let req = self.request(reqwest::Method::GET, "/v1/apps").query(&[("prefix", prefix)]);
        let list: AppList = parse(self.send(req).await?).await?;
        Ok(list.apps.into_iter().filter(|a| a.name.starts_with(prefix)).collect())
    }
}

#[derive(Clone, Debug)]
struct AppRecord {
    id: String,
    base_url: String,
}

pub struct CloudProvisioner {
    control: Arc<dyn ControlPlane>,
    client: WorkerClient,
    settings: CloudSettings,
    apps: DashMap<String, AppRecord>,
    provisioning: DashSet<String>,
    unit_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl CloudProvisioner {
    pub fn new(control: Arc<dyn ControlPlane>, client: WorkerClient, settings: CloudSettings) -> Self {
        Self {
            control,
            client,
            settings,
            apps: DashMap::new(),
            provisioning: DashSet::new(),
            unit_locks: DashMap::new(),
        }
    }

    pub fn is_tracked(&self, id: &str) -> bool {
        self.apps.iter().any(|r| r.id == id)
    }

    fn unit_lock(&self, name: &str) -> Arc<Mutex<()>> {
        self.unit_locks.entry(name.to_string()).or_default().clone()
    }

    /// Allow-listed variables, read from the host under the remote prefix.
    fn remote_env(&self) -> BTreeMap<String, String> {
        self.settings
            .env_allow_list
            .iter()
            .filter_map(|key| {
                let host_key = format!("{}{key}", self.settings.env_prefix);
                std::env::var(host_key).ok().filter(|v| !v.is_empty()).map(|v| (key.clone(), v))
            })
            .collect()
    }

    fn spec(&self, name: &str, working_dir: &str) -> AppSpec {
        AppSpec {
            name: name.to_string(),
            image: self.settings.image.clone(),
            region: self.settings.region.clone(),
            internal_port: self.settings.worker_port,
            env: self.remote_env(),
            labels: BTreeMap::from([
                (MANAGED_LABEL.to_string(), "true".to_string()),
                (UNIT_LABEL.to_string(), working_dir.to_string()),
            ]),
        }
    }

    async fn healthy_url(&self, app: &AppInfo) -> Option<String> {
        let url = app.url.as_deref()?.trim_end_matches('/').to_string();
        self.client.health(&url).await.then_some(url)
    }

    /// Poll until the new app's worker is healthy.
    async fn wait_ready(&self, mut app: AppInfo) -> Result<String, BackendError> {
        let poll = Duration::from_millis(self.settings.poll_interval_ms);
        loop {
            if let Some(url) = self.healthy_url(&app).await {
                return Ok(url);
            }
            tracing::debug!(app = %app.name, state = %app.state, "waiting for app");
            tokio::time::sleep(poll).await;
            app = self
                .control
                .get_app(&app.name)
                .await?
                .ok_or_else(|| BackendError::StartupFailure(format!("app {} disappeared while provisioning", app.name)))?;
        }
    }

    async fn provision(&self, name: &str, working_dir: &str) -> Result<AppRecord, BackendError> {
        if let Some(existing) = self.control.get_app(name).await? {
            if existing.is_running() {
                if let Some(base_url) = self.healthy_url(&existing).await {
                    tracing::info!(app = %existing.id, name, "adopting running app");
                    return Ok(AppRecord { id: existing.id, base_url });
                }
            }
            tracing::info!(app = %existing.id, name, state = %existing.state, "removing stale app");
            self.control.delete_app(name).await?;
        }

        let app = self
            .control
            .create_app(&self.spec(name, working_dir))
            .await
            .map_err(|e| BackendError::StartupFailure(format!("failed to create app {name}: {e}")))?;
        tracing::info!(app = %app.id, name, region = %self.settings.region, "app created");

        let budget = Duration::from_millis(self.settings.provision_timeout_ms);
        let id = app.id.clone();
        match tokio::time::timeout(budget, self.wait_ready(app)).await {
            Ok(Ok(base_url)) => Ok(AppRecord { id, base_url }),
            Ok(Err(e)) => Err(e),
            Err(_) => {
                let last = self.control.get_app(name).await.ok().flatten();
                let state = last.map(|a| a.state).unwrap_or_else(|| "missing".into());
                tracing::error!(app = %id, name, %state, "app not healthy within provisioning budget");
                if let Err(e) = self.control.delete_app(name).await {
                    tracing::warn!(app = %id, error = %e, "failed to delete unready app");
                }
                Err(BackendError::StartupFailure(format!(
                    "app {name} not healthy within {budget:?} (last state: {state})"
                )))
            }
        }
    }
}

#[async_trait]
impl Provisioner for CloudProvisioner {
    fn kind(&self) -> BackendKind {
        BackendKind::Cloud
    }

    fn unit_name(&self, working_dir: &str) -> String {
        container_name(&self.settings.app_prefix, working_dir)
    }

    #[instrument(skip(self), fields(backend = "cloud"))]
    async fn ensure_unit(&self, working_dir: &str) -> Result<ExecutionUnit, BackendError> {
        let name = self.unit_name(working_dir);
        let lock = self.unit_lock(&name);
        let _guard = lock.lock().await;

        if let Some(record) = self.apps.get(&name).map(|r| r.clone()) {
            if self.client.health(&record.base_url).await {
                return Ok(ExecutionUnit { name, id: record.id, base_url: record.base_url });
            }
            tracing::warn!(app = %record.id, "tracked app unhealthy, replacing");
            self.apps.remove(&name);
        }

        self.provisioning.insert(name.clone());
        let result = self.provision(&name, working_dir).await;
        if let Ok(record) = &result {
            self.apps.insert(name.clone(), record.clone());
        }
        self.provisioning.remove(&name);

        let record = result?;
        Ok(ExecutionUnit { name, id: record.id, base_url: record.base_url })
    }

    async fn unit_state(&self, working_dir: &str) -> Result<ContainerState, BackendError> {
        let name = self.unit_name(working_dir);
        let Some(app) = self.control.get_app(&name).await? else {
            return Ok(ContainerState::missing(name));
        };
        let healthy = app.is_running() && self.healthy_url(&app).await.is_some();
        Ok(ContainerState {
            status: if app.is_running() { ContainerStatus::Running } else { ContainerStatus::Stopped },
            name: Some(name),
            id: Some(app.id),
            address: app.url,
            healthy,
        })
    }

    #[instrument(skip(self), fields(backend = "cloud"))]
    async fn teardown(&self, working_dir: &str) -> Result<(), BackendError> {
        let name = self.unit_name(working_dir);
        let lock = self.unit_lock(&name);
        let _guard = lock.lock().await;
        self.apps.remove(&name);
        self.control.delete_app(&name).await
    }

    #[instrument(skip(self), fields(backend = "cloud"))]
    async fn cleanup_orphans(&self) -> Result<usize, BackendError> {
        let listed = self.control.list_apps(&self.settings.app_prefix).await?;
        let mut removed = 0;
        for app in listed {
            if self.is_tracked(&app.id) || self.provisioning.contains(&app.name) {
                continue;
            }
            match self.control.delete_app(&app.name).await {
                Ok(()) => {
                    tracing::info!(app = %app.id, name = %app.name, "deleted orphan app");
                    removed += 1;
                }
                Err(e) => tracing::warn!(app = %app.id, error = %e, "failed to delete orphan app"),
            }
        }
        Ok(removed)
    }

    fn teardown_on_stop(&self) -> bool {
        self.settings.teardown_on_stop
    }
}
