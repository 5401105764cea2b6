//! Session store, auth, and logging settings.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tether_core::retry::RetryConfig;

/// Which session store implementation to use.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process-local map. Sessions do not survive restarts or cross instances.
    Memory,
    /// SQLite file shared by every instance on the host.
    #[default]
    Sqlite,
}

/// Session store settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreSettings {
    /// Backend selection.
    pub backend: StoreBackend,
    /// SQLite database path (relative paths resolve under `~/.tether`).
    pub db_path: String,
    /// Inactivity TTL for session and ownership records.
    pub session_ttl_ms: u64,
    /// How often TTL-expired sessions are swept.
    pub sweep_interval_ms: u64,
    /// Minimum spacing between activity touches from one connection.
    pub touch_interval_ms: u64,
    /// Per-call timeout.
    pub op_timeout_ms: u64,
    /// Retry policy for transient failures.
    pub retry: RetryConfig,
    /// Concurrent store calls allowed (bulkhead).
    pub max_in_flight: usize,
    /// Consecutive failures that open the circuit breaker.
    pub breaker_failure_threshold: u32,
    /// How long an open breaker short-circuits calls.
    pub breaker_cooldown_ms: u64,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Sqlite,
            db_path: "sessions.db".to_string(),
            session_ttl_ms: 30 * 60 * 1000,
            sweep_interval_ms: 60_000,
            touch_interval_ms: 5_000,
            op_timeout_ms: 2_000,
            retry: RetryConfig::default(),
            max_in_flight: 32,
            breaker_failure_threshold: 5,
            breaker_cooldown_ms: 10_000,
        }
    }
}

impl StoreSettings {
    /// Session TTL.
    pub fn session_ttl(&self) -> Duration {
        Duration::from_millis(self.session_ttl_ms)
    }

    /// Sweep period.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    /// Touch rate limit.
    pub fn touch_interval(&self) -> Duration {
        Duration::from_millis(self.touch_interval_ms)
    }

    /// Per-call timeout.
    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms)
    }

    /// Breaker cooldown.
    pub fn breaker_cooldown(&self) -> Duration {
        Duration::from_millis(self.breaker_cooldown_ms)
    }
}

/// Auth gate and resume token settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthSettings {
    /// HS256 secret for bearer JWTs. Required to accept connections.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jwt_secret: Option<String>,
    /// Expected `iss` claim.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jwt_issuer: Option<String>,
    /// Expected `aud` claim.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jwt_audience: Option<String>,
    /// HMAC key for resume tokens. Falls back to `jwt_secret`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resume_secret: Option<String>,
    /// Bound on a single auth gate call.
    pub timeout_ms: u64,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            jwt_secret: None,
            jwt_issuer: None,
            jwt_audience: None,
            resume_secret: None,
            timeout_ms: 2_000,
        }
    }
}

impl AuthSettings {
    /// Auth gate call timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Key used to sign resume tokens.
    pub fn resume_key(&self) -> Option<&str> {
        self.resume_secret
            .as_deref()
            .or(self.jwt_secret.as_deref())
    }
}

/// Logging settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter directive (`RUST_LOG` wins when set).
    pub level: String,
    /// `compact` or `json`.
    pub format: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "compact".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_lowercase_wire() {
        let b: StoreBackend = serde_json::from_str("\"memory\"").unwrap();
        assert_eq!(b, StoreBackend::Memory);
    }

    #[test]
    fn resume_key_falls_back_to_jwt_secret() {
        let auth = AuthSettings {
            jwt_secret: Some("jwt".into()),
            ..AuthSettings::default()
        };
        assert_eq!(auth.resume_key(), Some("jwt"));

        let auth = AuthSettings {
            resume_secret: Some("resume".into()),
            ..auth
        };
        assert_eq!(auth.resume_key(), Some("resume"));
    }

    #[test]
    fn auth_timeout_default() {
        assert_eq!(AuthSettings::default().timeout(), Duration::from_secs(2));
    }

    #[test]
    fn nested_retry_config_parses() {
        let s: StoreSettings =
            serde_json::from_str(r#"{"retry": {"maxRetries": 9}}"#).unwrap();
        assert_eq!(s.retry.max_retries, 9);
        assert_eq!(s.max_in_flight, 32);
    }
}
