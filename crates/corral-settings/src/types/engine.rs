//! Engine-side settings: plans, hooks, telemetry and the worker server.

use serde::{Deserialize, Serialize};

/// Plan capture. A write-tool call whose path matches any of the patterns is
/// remembered so a later plan proposal can recover its content.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PlanSettings {
    /// Regular expressions matched against the written path.
    pub path_patterns: Vec<String>,
    /// Plan file looked up at the project root as a last local resort.
    pub default_file_name: String,
}

impl Default for PlanSettings {
    fn default() -> Self {
        Self {
            path_patterns: vec![
                r"/plans/".to_string(),
                r"(?i)/\.[^/]+/(?:.*/)?[^/]*plan\.md$".to_string(),
            ],
            default_file_name: "PLAN.md".to_string(),
        }
    }
}

/// Shell commands run in the working directory when a session starts.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HookSettings {
    pub session_start: Vec<String>,
    pub timeout_ms: u64,
}

impl Default for HookSettings {
    fn default() -> Self {
        Self {
            session_start: Vec::new(),
            timeout_ms: 30_000,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TelemetrySettings {
    /// Default level when `RUST_LOG` is unset.
    pub level: String,
    /// JSON lines on stderr instead of compact text.
    pub json: bool,
    /// Persist warnings and errors to SQLite.
    pub sqlite_enabled: bool,
    /// Log database path (relative paths resolve under `~/.corral`).
    pub sqlite_path: String,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: true,
            sqlite_enabled: true,
            sqlite_path: "logs.db".to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkerSettings {
    pub host: String,
    pub port: u16,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8420,
        }
    }
}
