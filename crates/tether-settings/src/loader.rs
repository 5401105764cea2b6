//! Layered settings resolution.
//!
//! [`load_settings_from_path`] serializes [`TetherSettings::default()`] to
//! JSON, overlays the settings file with [`deep_merge`], deserializes, applies
//! `TETHER_*` variables, and validates. A missing file is not an error.
//!
//! When merging, nested objects merge key by key and a `null` leaves the
//! lower layer untouched. Any other value wins outright.

use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::{StoreBackend, TetherSettings};

/// Root directory for Tether state (`~/.tether`).
pub fn tether_home() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".tether")
}

/// Resolve the path to the settings file (`~/.tether/settings.json`).
pub fn settings_path() -> PathBuf {
    tether_home().join("settings.json")
}

/// Resolve `store.dbPath`: absolute paths are kept, relative ones are placed
/// under [`tether_home`].
pub fn resolve_db_path(db_path: &str) -> PathBuf {
    let p = Path::new(db_path);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        tether_home().join(p)
    }
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<TetherSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// If the file does not exist, returns defaults. Invalid JSON or a failed
/// validation is an error.
pub fn load_settings_from_path(path: &Path) -> Result<TetherSettings> {
    let defaults = serde_json::to_value(TetherSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: TetherSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

/// Overlay `overlay` onto `base`, recursing into objects.
pub fn deep_merge(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Object(mut base), Value::Object(overlay)) => {
            for (key, value) in overlay.into_iter().filter(|(_, v)| !v.is_null()) {
                let next = match base.remove(&key) {
                    Some(prev) => deep_merge(prev, value),
                    None => value,
                };
                let _ = base.insert(key, next);
            }
            Value::Object(base)
        }
        (_, overlay) => overlay,
    }
}

/// Apply environment variable overrides to loaded settings.
///
/// Integers must parse and fall within the stated range; invalid values are
/// logged and ignored (the file/default value stays).
pub fn apply_env_overrides(settings: &mut TetherSettings) {
    if let Some(v) = read_env_string("TETHER_INSTANCE_ID") {
        settings.instance_id = Some(v);
    }

    // ── Server ──────────────────────────────────────────────────────
    if let Some(v) = read_env_string("TETHER_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = read_env_in_range("TETHER_PORT", 0, 65535) {
        settings.server.port = v;
    }
    if let Some(v) = read_env_in_range("TETHER_MAX_CONNECTIONS", 1, 10_000_000) {
        settings.server.max_connections = v;
    }

    // ── Heartbeat / reconnect ───────────────────────────────────────
    if let Some(v) = read_env_in_range("TETHER_HEARTBEAT_INTERVAL_MS", 100, 3_600_000) {
        settings.heartbeat.interval_ms = v;
    }
    if let Some(v) = read_env_in_range("TETHER_HEARTBEAT_MISSED_THRESHOLD", 1, 100) {
        settings.heartbeat.missed_threshold = v;
    }
    if let Some(v) = read_env_in_range("TETHER_GRACE_WINDOW_MS", 0, 86_400_000) {
        settings.reconnect.grace_window_ms = v;
    }

    // ── Protocol ────────────────────────────────────────────────────
    if let Some(v) = read_env_in_range("TETHER_MAX_FRAME_BYTES", 64, 64 * 1024 * 1024) {
        settings.protocol.max_frame_bytes = v;
    }

    // ── Store ───────────────────────────────────────────────────────
    if let Some(v) = read_env_string("TETHER_STORE_BACKEND") {
        match parse_backend(&v) {
            Some(b) => settings.store.backend = b,
            None => tracing::warn!(key = "TETHER_STORE_BACKEND", value = %v, "unknown store backend, ignoring"),
        }
    }
    if let Some(v) = read_env_string("TETHER_DB_PATH") {
        settings.store.db_path = v;
    }
    if let Some(v) = read_env_in_range("TETHER_SESSION_TTL_MS", 1_000, 30 * 86_400_000) {
        settings.store.session_ttl_ms = v;
    }

    // ── Auth ────────────────────────────────────────────────────────
    if let Some(v) = read_env_string("TETHER_JWT_SECRET") {
        settings.auth.jwt_secret = Some(v);
    }
    if let Some(v) = read_env_string("TETHER_RESUME_SECRET") {
        settings.auth.resume_secret = Some(v);
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = read_env_string("TETHER_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = read_env_string("TETHER_LOG_FORMAT") {
        settings.logging.format = v;
    }
}

/// Parse a store backend name (case-insensitive).
pub fn parse_backend(val: &str) -> Option<StoreBackend> {
    match val.to_lowercase().as_str() {
        "memory" => Some(StoreBackend::Memory),
        "sqlite" => Some(StoreBackend::Sqlite),
        _ => None,
    }
}

/// Parse `val` as a number in `min..=max`.
pub fn parse_in_range<T>(val: &str, min: T, max: T) -> Option<T>
where
    T: FromStr + PartialOrd,
{
    val.trim().parse().ok().filter(|n| (min..=max).contains(n))
}

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn read_env_in_range<T>(name: &str, min: T, max: T) -> Option<T>
where
    T: FromStr + PartialOrd + Display + Copy,
{
    let raw = std::env::var(name).ok()?;
    let parsed = parse_in_range(&raw, min, max);
    if parsed.is_none() {
        tracing::warn!(key = name, value = %raw, %min, %max, "env override out of range, ignoring");
    }
    parsed
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
