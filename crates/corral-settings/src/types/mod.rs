//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase", default)]` so a partial
//! JSON file only needs the keys it changes.

mod backends;
mod engine;

pub use backends::*;
pub use engine::*;

use corral_core::backend::BackendKind;
use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings type.
///
/// ```json
/// {
///   "backend": { "kind": "docker" },
///   "docker": { "image": "corral-worker:dev", "healthAttempts": 60 }
/// }
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CorralSettings {
    /// Settings schema version.
    pub version: String,
    /// Backend selection and shared defaults.
    pub backend: BackendSettings,
    /// In-process agent runtime.
    pub local: LocalSettings,
    /// Locally spawned containers.
    pub docker: DockerSettings,
    /// Cloud-provisioned apps.
    pub cloud: CloudSettings,
    /// Plan file capture and resolution.
    pub plans: PlanSettings,
    /// Session-start hooks.
    pub hooks: HookSettings,
    /// Logging.
    pub telemetry: TelemetrySettings,
    /// Worker HTTP server.
    pub worker: WorkerSettings,
}

impl Default for CorralSettings {
    fn default() -> Self {
        Self {
            version: "0.1.0".to_string(),
            backend: BackendSettings::default(),
            local: LocalSettings::default(),
            docker: DockerSettings::default(),
            cloud: CloudSettings::default(),
            plans: PlanSettings::default(),
            hooks: HookSettings::default(),
            telemetry: TelemetrySettings::default(),
            worker: WorkerSettings::default(),
        }
    }
}

impl CorralSettings {
    /// Reject values that would make a lifecycle loop degenerate.
    pub fn validate(&self) -> Result<()> {
        if self.docker.health_attempts == 0 {
            return Err(SettingsError::InvalidValue("docker.healthAttempts must be at least 1".into()));
        }
        if self.cloud.poll_interval_ms == 0 {
            return Err(SettingsError::InvalidValue("cloud.pollIntervalMs must be positive".into()));
        }
        if self.cloud.provision_timeout_ms < self.cloud.poll_interval_ms {
            return Err(SettingsError::InvalidValue(
                "cloud.provisionTimeoutMs must not be shorter than cloud.pollIntervalMs".into(),
            ));
        }
        if !matches!(self.cloud.protocol.as_str(), "native" | "a2a") {
            return Err(SettingsError::InvalidValue(format!(
                "cloud.protocol must be \"native\" or \"a2a\", got {:?}",
                self.cloud.protocol
            )));
        }
        if self.docker.worker_port == 0 || self.worker.port == 0 {
            return Err(SettingsError::InvalidValue("worker ports must be non-zero".into()));
        }
        Ok(())
    }
}

/// Backend selection.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BackendSettings {
    /// Which execution backend sessions run on.
    pub kind: BackendKind,
    /// Model used when a session doesn't name one.
    pub default_model: String,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            kind: BackendKind::Local,
            default_model: "sonnet".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        CorralSettings::default().validate().unwrap();
    }

    #[test]
    fn zero_health_attempts_rejected() {
        let mut s = CorralSettings::default();
        s.docker.health_attempts = 0;
        assert!(matches!(s.validate(), Err(SettingsError::InvalidValue(_))));
    }

    #[test]
    fn provisioning_timeout_must_cover_one_poll() {
        let mut s = CorralSettings::default();
        s.cloud.poll_interval_ms = 10_000;
        s.cloud.provision_timeout_ms = 5_000;
        assert!(s.validate().is_err());
    }

    #[test]
    fn unknown_cloud_protocol_rejected() {
        let mut s = CorralSettings::default();
        s.cloud.protocol = "grpc".into();
        assert!(s.validate().is_err());
        s.cloud.protocol = "a2a".into();
        s.validate().unwrap();
    }

    #[test]
    fn serializes_camel_case() {
        let v = serde_json::to_value(CorralSettings::default()).unwrap();
        assert_eq!(v["backend"]["kind"], "local");
        assert!(v["docker"]["healthAttempts"].is_u64());
        assert!(v["plans"]["pathPatterns"].is_array());
    }
}
