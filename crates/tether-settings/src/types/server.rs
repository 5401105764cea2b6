//! Listener, heartbeat, reconnect, and protocol settings.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// HTTP/WebSocket listener and admission settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Listen port (0 picks a free port).
    pub port: u16,
    /// Maximum concurrent connections on this instance.
    pub max_connections: usize,
    /// Per-connection outbound queue capacity (messages).
    pub outbound_queue_capacity: usize,
    /// Upper bound on graceful shutdown.
    pub shutdown_timeout_ms: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            max_connections: 10_000,
            outbound_queue_capacity: 256,
            shutdown_timeout_ms: 10_000,
        }
    }
}

impl ServerSettings {
    /// Graceful shutdown bound.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

/// Heartbeat probing settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HeartbeatSettings {
    /// Probe interval: each connection is examined once per interval.
    pub interval_ms: u64,
    /// Unanswered probes before the connection is declared dead.
    pub missed_threshold: u32,
    /// Time-wheel tick; the wheel has `ceil(interval / tick)` buckets.
    pub tick_ms: u64,
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            interval_ms: 30_000,
            missed_threshold: 3,
            tick_ms: 1_000,
        }
    }
}

impl HeartbeatSettings {
    /// Probe interval.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Wheel tick.
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }
}

/// Session resume settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReconnectSettings {
    /// How long a dropped session waits for a resume.
    pub grace_window_ms: u64,
    /// Lifetime of an issued resume token.
    pub resume_token_ttl_ms: u64,
    /// How often expired grace windows are finalized.
    pub finalize_interval_ms: u64,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            grace_window_ms: 60_000,
            resume_token_ttl_ms: 24 * 60 * 60 * 1000,
            finalize_interval_ms: 5_000,
        }
    }
}

impl ReconnectSettings {
    /// Grace window.
    pub fn grace_window(&self) -> Duration {
        Duration::from_millis(self.grace_window_ms)
    }

    /// Resume token lifetime.
    pub fn resume_token_ttl(&self) -> Duration {
        Duration::from_millis(self.resume_token_ttl_ms)
    }

    /// Finalizer sweep period.
    pub fn finalize_interval(&self) -> Duration {
        Duration::from_millis(self.finalize_interval_ms)
    }
}

/// Wire codec settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProtocolSettings {
    /// Largest accepted inbound frame.
    pub max_frame_bytes: usize,
    /// Consecutive malformed messages tolerated before disconnecting.
    pub max_consecutive_malformed: u32,
}

impl Default for ProtocolSettings {
    fn default() -> Self {
        Self {
            max_frame_bytes: 64 * 1024,
            max_consecutive_malformed: 5,
        }
    }
}
