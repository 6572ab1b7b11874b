//! # corral-settings
//!
//! Layered configuration for the session engine.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`CorralSettings::default()`]
//! 2. **User file**: `~/.corral/settings.json` (deep-merged over defaults)
//! 3. **Environment variables**: `CORRAL_*` overrides
//!
//! ```no_run
//! use corral_settings::get_settings;
//!
//! let settings = get_settings();
//! println!("backend: {}", settings.backend.kind);
//! ```

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{corral_dir, deep_merge, load_settings, load_settings_from_path, resolve_in_corral_dir, settings_path};
pub use types::*;

use std::sync::OnceLock;

static SETTINGS: OnceLock<CorralSettings> = OnceLock::new();

/// Get the global settings instance, loading it on first access. Falls back
/// to compiled defaults if loading fails.
pub fn get_settings() -> &'static CorralSettings {
    SETTINGS.get_or_init(|| match load_settings() {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(error = %e, "failed to load settings, using defaults");
            CorralSettings::default()
        }
    })
}

/// Initialize the global settings with a specific value.
///
/// # Errors
///
/// Returns the provided settings back if the global was already initialized.
#[allow(clippy::result_large_err)]
pub fn init_settings(settings: CorralSettings) -> std::result::Result<(), CorralSettings> {
    SETTINGS.set(settings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn re_exports_work() {
        let _settings = CorralSettings::default();
        assert!(settings_path().ends_with(".corral/settings.json"));
    }

    #[test]
    fn deep_merge_re_exported() {
        let merged = deep_merge(serde_json::json!({"x": 1}), serde_json::json!({"y": 2}));
        assert_eq!(merged["x"], 1);
        assert_eq!(merged["y"], 2);
    }
}
