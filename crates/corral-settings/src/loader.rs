//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`CorralSettings::default()`]
//! 2. If `~/.corral/settings.json` exists, deep-merge user values over defaults
//! 3. Apply `CORRAL_*` environment overrides (highest priority)
//! 4. Validate

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::CorralSettings;

/// `~/.corral`, falling back to `/tmp/.corral` without a home directory.
pub fn corral_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".corral")
}

/// Resolve the path to the settings file (`~/.corral/settings.json`).
pub fn settings_path() -> PathBuf {
    corral_dir().join("settings.json")
}

/// Resolve a possibly-relative path against `~/.corral`.
pub fn resolve_in_corral_dir(path: &str) -> PathBuf {
    let p = Path::new(path);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        corral_dir().join(p)
    }
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<CorralSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults; invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<CorralSettings> {
    let defaults = serde_json::to_value(CorralSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: CorralSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
///
/// - Objects are merged recursively (source overrides target per-key)
/// - Arrays and primitives are replaced entirely by source
/// - Null values in source are skipped (preserving target)
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply environment variable overrides to loaded settings.
///
/// Invalid values are logged and ignored (file/default value stays).
pub fn apply_env_overrides(settings: &mut CorralSettings) {
    // Backend
    if let Some(v) = read_env_string("CORRAL_BACKEND") {
        match v.parse() {
            Ok(kind) => settings.backend.kind = kind,
            Err(e) => tracing::warn!(key = "CORRAL_BACKEND", value = %v, error = %e, "invalid env var, ignoring"),
        }
    }
    if let Some(v) = read_env_string("CORRAL_MODEL") {
        settings.backend.default_model = v;
    }
    if let Some(v) = read_env_string("CORRAL_AGENT_BINARY") {
        settings.local.agent_binary = v;
    }

    // Docker
    if let Some(v) = read_env_string("CORRAL_DOCKER_IMAGE") {
        settings.docker.image = v;
    }
    if let Some(v) = read_env_string("CORRAL_DOCKER_NETWORK") {
        settings.docker.network = Some(v);
    }
    if let Some(v) = read_env_u64("CORRAL_HEALTH_ATTEMPTS", 1, 1_000) {
        settings.docker.health_attempts = v as u32;
    }
    if let Some(v) = read_env_u64("CORRAL_HEALTH_DELAY_MS", 10, 60_000) {
        settings.docker.health_delay_ms = v;
    }
    if let Some(v) = read_env_bool("CORRAL_DOCKER_SOCKET") {
        settings.docker.mount_runtime_socket = v;
    }

    // Cloud
    if let Some(v) = read_env_string("CORRAL_CLOUD_URL") {
        settings.cloud.control_plane_url = v;
    }
    if let Some(v) = read_env_string("CORRAL_CLOUD_REGION") {
        settings.cloud.region = v;
    }
    if let Some(v) = read_env_u64("CORRAL_PROVISION_TIMEOUT_MS", 1_000, 3_600_000) {
        settings.cloud.provision_timeout_ms = v;
    }
    if let Some(v) = read_env_string("CORRAL_CLOUD_PROTOCOL") {
        settings.cloud.protocol = v.to_lowercase();
    }

    // Telemetry
    if let Some(v) = read_env_string("CORRAL_LOG_LEVEL") {
        settings.telemetry.level = v;
    }
    if let Some(v) = read_env_bool("CORRAL_LOG_JSON") {
        settings.telemetry.json = v;
    }
    if let Some(v) = read_env_bool("CORRAL_LOG_SQLITE") {
        settings.telemetry.sqlite_enabled = v;
    }

    // Worker
    if let Some(v) = read_env_string("CORRAL_WORKER_HOST") {
        settings.worker.host = v;
    }
    if let Some(v) = read_env_u16("CORRAL_WORKER_PORT", 1, 65535) {
        settings.worker.port = v;
    }
}

// Pure parsing functions (testable without env vars)

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u16` within a range.
pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

// Env var readers

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn read_env_bool(name: &str) -> Option<bool> {
    let val = std::env::var(name).ok()?;
    let result = parse_bool(&val);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid boolean env var, ignoring");
    }
    result
}

fn read_env_u16(name: &str, min: u16, max: u16) -> Option<u16> {
    let val = std::env::var(name).ok()?;
    let result = parse_u16_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid u16 env var, ignoring");
    }
    result
}

fn read_env_u64(name: &str, min: u64, max: u64) -> Option<u64> {
    let val = std::env::var(name).ok()?;
    let result = parse_u64_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid u64 env var, ignoring");
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::SettingsError;
    use corral_core::backend::BackendKind;

    // deep_merge

    #[test]
    fn merge_nested_override() {
        let target = serde_json::json!({"docker": {"image": "a", "workerPort": 8420}});
        let source = serde_json::json!({"docker": {"image": "b"}});
        let merged = deep_merge(target, source);
        assert_eq!(merged["docker"]["image"], "b");
        assert_eq!(merged["docker"]["workerPort"], 8420);
    }

    #[test]
    fn merge_array_replace() {
        let target = serde_json::json!({"items": [1, 2, 3]});
        let source = serde_json::json!({"items": [4]});
        assert_eq!(deep_merge(target, source)["items"], serde_json::json!([4]));
    }

    #[test]
    fn merge_null_preserves_target() {
        let target = serde_json::json!({"a": 1, "b": 2});
        let source = serde_json::json!({"a": null});
        let merged = deep_merge(target, source);
        assert_eq!(merged["a"], 1);
        assert_eq!(merged["b"], 2);
    }

    #[test]
    fn merge_primitive_replaces_object() {
        let target = serde_json::json!({"a": {"nested": true}});
        let source = serde_json::json!({"a": 42});
        assert_eq!(deep_merge(target, source)["a"], 42);
    }

    #[test]
    fn merge_new_keys_added() {
        let merged = deep_merge(serde_json::json!({"a": 1}), serde_json::json!({"b": 2}));
        assert_eq!(merged["a"], 1);
        assert_eq!(merged["b"], 2);
    }

    // load_settings_from_path

    #[test]
    fn load_missing_file_returns_defaults() {
        let settings = load_settings_from_path(Path::new("/nonexistent/settings.json")).unwrap();
        assert_eq!(settings.docker.worker_port, CorralSettings::default().docker.worker_port);
    }

    #[test]
    fn load_partial_json_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"backend": {"kind": "docker"}, "docker": {"healthAttempts": 5}, "plans": {"pathPatterns": ["/design/"]}}"#,
        )
        .unwrap();

        let settings = load_settings_from_path(&path).unwrap();
        assert_eq!(settings.backend.kind, BackendKind::Docker);
        assert_eq!(settings.docker.health_attempts, 5);
        assert_eq!(settings.docker.health_delay_ms, 1000);
        assert_eq!(settings.plans.path_patterns, vec!["/design/".to_string()]);
        assert_eq!(settings.plans.default_file_name, "PLAN.md");
    }

    #[test]
    fn load_invalid_json_returns_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "not valid json").unwrap();
        assert!(matches!(load_settings_from_path(&path), Err(SettingsError::Json(_))));
    }

    #[test]
    fn load_rejects_invalid_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"docker": {"healthAttempts": 0}}"#).unwrap();
        assert!(matches!(load_settings_from_path(&path), Err(SettingsError::InvalidValue(_))));
    }

    #[test]
    fn resolve_relative_and_absolute() {
        assert!(resolve_in_corral_dir("logs.db").ends_with(".corral/logs.db"));
        assert_eq!(resolve_in_corral_dir("/var/log/c.db"), PathBuf::from("/var/log/c.db"));
    }

    // parsers

    #[test]
    fn parse_bool_variants() {
        for val in &["true", "1", "yes", "on", "TRUE", "On"] {
            assert_eq!(parse_bool(val), Some(true), "failed for {val}");
        }
        for val in &["false", "0", "no", "off", "NO"] {
            assert_eq!(parse_bool(val), Some(false), "failed for {val}");
        }
        assert_eq!(parse_bool("maybe"), None);
        assert_eq!(parse_bool(""), None);
    }

    #[test]
    fn parse_u16_bounds() {
        assert_eq!(parse_u16_range("8420", 1, 65535), Some(8420));
        assert_eq!(parse_u16_range("0", 1, 65535), None);
        assert_eq!(parse_u16_range("99999", 1, 65535), None);
        assert_eq!(parse_u16_range("port", 1, 65535), None);
    }

    #[test]
    fn parse_u64_bounds() {
        assert_eq!(parse_u64_range("500", 10, 60_000), Some(500));
        assert_eq!(parse_u64_range("5", 10, 60_000), None);
        assert_eq!(parse_u64_range("70000", 10, 60_000), None);
    }
}
