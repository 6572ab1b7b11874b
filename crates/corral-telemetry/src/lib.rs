mod logging;

pub use logging::{LogQuery, LogRecord, SqliteLogLayer, SqliteLogSink};

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use corral_settings::{resolve_in_corral_dir, TelemetrySettings};
use parking_lot::RwLock;
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "corral_backends" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// JSON lines instead of compact text.
    pub json: bool,
    /// Whether to persist warn+ logs to SQLite.
    pub log_to_sqlite: bool,
    /// Path to the log database.
    pub log_db_path: PathBuf,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self::from_settings(&TelemetrySettings::default())
    }
}

impl TelemetryConfig {
    pub fn from_settings(settings: &TelemetrySettings) -> Self {
        Self {
            log_level: Level::from_str(&settings.level).unwrap_or(Level::INFO),
            module_levels: Vec::new(),
            json: settings.json,
            log_to_sqlite: settings.sqlite_enabled,
            log_db_path: resolve_in_corral_dir(&settings.sqlite_path),
        }
    }

    fn filter_directive(&self) -> String {
        let mut filter = self.log_level.to_string().to_lowercase();
        for (module, level) in &self.module_levels {
            filter.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
        }
        filter
    }
}

/// Keeps the log sink alive for the life of the process.
pub struct TelemetryGuard {
    log_sink: Option<Arc<SqliteLogSink>>,
    level_filter: Arc<RwLock<Vec<(String, Level)>>>,
}

impl TelemetryGuard {
    /// Record a per-module level override.
    pub fn set_module_level(&self, module: &str, level: Level) {
        let mut levels = self.level_filter.write();
        if let Some(entry) = levels.iter_mut().find(|(m, _)| m == module) {
            entry.1 = level;
        } else {
            levels.push((module.to_string(), level));
        }
    }

    pub fn module_levels(&self) -> Vec<(String, Level)> {
        self.level_filter.read().clone()
    }

    /// Access the log sink for querying persisted logs.
    pub fn logs(&self) -> Option<&SqliteLogSink> {
        self.log_sink.as_deref()
    }
}

/// Initialize the telemetry subsystem. Call once at startup; later calls
/// leave the first subscriber in place.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let level_filter = Arc::new(RwLock::new(config.module_levels.clone()));
    let directive = config.filter_directive();
    let env_filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&directive));

    // stdout carries command output; logs go to stderr
    let json_layer = config.json.then(|| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .with_writer(std::io::stderr)
            .with_filter(env_filter())
    });
    let text_layer = (!config.json).then(|| {
        tracing_subscriber::fmt::layer()
            .compact()
            .with_target(true)
            .with_writer(std::io::stderr)
            .with_filter(env_filter())
    });

    let (sqlite_layer, sqlite_sink) = if config.log_to_sqlite {
        match SqliteLogSink::new(&config.log_db_path) {
            Ok(sink) => {
                let sink = Arc::new(sink);
                (Some(SqliteLogLayer::new(sink.clone())), Some(sink))
            }
            Err(e) => {
                eprintln!("corral-telemetry: failed to open log DB: {e}");
                (None, None)
            }
        }
    } else {
        (None, None)
    };

    if let Err(e) = tracing_subscriber::registry()
        .with(json_layer)
        .with(text_layer)
        .with(sqlite_layer)
        .try_init()
    {
        eprintln!("corral-telemetry: subscriber already installed: {e}");
    }

    TelemetryGuard {
        log_sink: sqlite_sink,
        level_filter,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_from_settings() {
        let settings = TelemetrySettings {
            level: "debug".into(),
            json: false,
            sqlite_enabled: false,
            sqlite_path: "/tmp/corral-test/logs.db".into(),
        };
        let config = TelemetryConfig::from_settings(&settings);
        assert_eq!(config.log_level, Level::DEBUG);
        assert!(!config.json);
        assert!(!config.log_to_sqlite);
        assert_eq!(config.log_db_path, PathBuf::from("/tmp/corral-test/logs.db"));
    }

    #[test]
    fn bad_level_falls_back_to_info() {
        let settings = TelemetrySettings { level: "chatty".into(), ..Default::default() };
        assert_eq!(TelemetryConfig::from_settings(&settings).log_level, Level::INFO);
    }

    #[test]
    fn filter_directive_includes_modules() {
        let mut config = TelemetryConfig::default();
        config.module_levels.push(("corral_backends".into(), Level::DEBUG));
        assert_eq!(config.filter_directive(), "info,corral_backends=debug");
    }

    #[test]
    fn guard_tracks_module_levels() {
        let guard = TelemetryGuard {
            log_sink: None,
            level_filter: Arc::new(RwLock::new(Vec::new())),
        };
        guard.set_module_level("corral_engine", Level::DEBUG);
        guard.set_module_level("corral_engine", Level::TRACE);
        assert_eq!(guard.module_levels(), vec![("corral_engine".to_string(), Level::TRACE)]);
        assert!(guard.logs().is_none());
    }
}
