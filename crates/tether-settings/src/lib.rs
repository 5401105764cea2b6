//! # tether-settings
//!
//! Configuration management with layered sources.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults** ([`TetherSettings::default()`])
//! 2. **Settings file**: `~/.tether/settings.json` or an explicit path
//!    (deep-merged over defaults)
//! 3. **Environment variables**: `TETHER_*` overrides (highest priority)
//!
//! The result is validated before it is returned; durations are stored in
//! milliseconds and exposed as [`std::time::Duration`] through accessors.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{
    deep_merge, load_settings, load_settings_from_path, resolve_db_path, settings_path, tether_home,
};
pub use types::*;

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings_are_valid() {
        let settings = TetherSettings::default();
        settings.validate().unwrap();
        assert_eq!(settings.server.port, 8080);
        assert_eq!(settings.heartbeat.interval_ms, 30_000);
        assert_eq!(settings.heartbeat.missed_threshold, 3);
        assert_eq!(settings.reconnect.grace_window_ms, 60_000);
        assert_eq!(settings.store.backend, StoreBackend::Sqlite);
    }

    #[test]
    fn re_exports_work() {
        let merged = deep_merge(serde_json::json!({"x": 1}), serde_json::json!({"y": 2}));
        assert_eq!(merged["x"], 1);
        assert!(settings_path().ends_with("settings.json"));
    }
}
