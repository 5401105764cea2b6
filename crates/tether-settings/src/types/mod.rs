//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase", default)]` so partial
//! JSON works: missing fields get their default value.

mod server;
mod store;

pub use server::*;
pub use store::*;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings type.
///
/// ```json
/// {
///   "server": { "port": 9090 },
///   "heartbeat": { "intervalMs": 15000 },
///   "store": { "backend": "memory" }
/// }
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TetherSettings {
    /// Settings schema version.
    pub version: String,
    /// Stable identifier of this instance. Generated at startup when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    /// HTTP/WebSocket listener and admission.
    pub server: ServerSettings,
    /// Liveness probing.
    pub heartbeat: HeartbeatSettings,
    /// Session resume grace window.
    pub reconnect: ReconnectSettings,
    /// Wire codec limits.
    pub protocol: ProtocolSettings,
    /// Session store backend and resilience.
    pub store: StoreSettings,
    /// Bearer token validation and resume token signing.
    pub auth: AuthSettings,
    /// Log level and format.
    pub logging: LoggingSettings,
}

impl Default for TetherSettings {
    fn default() -> Self {
        Self {
            version: "0.1.0".to_string(),
            instance_id: None,
            server: ServerSettings::default(),
            heartbeat: HeartbeatSettings::default(),
            reconnect: ReconnectSettings::default(),
            protocol: ProtocolSettings::default(),
            store: StoreSettings::default(),
            auth: AuthSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

impl TetherSettings {
    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        fn ensure(ok: bool, msg: &str) -> Result<()> {
            if ok {
                Ok(())
            } else {
                Err(SettingsError::InvalidValue(msg.to_string()))
            }
        }

        ensure(self.server.max_connections > 0, "server.maxConnections must be > 0")?;
        ensure(
            self.server.outbound_queue_capacity > 0,
            "server.outboundQueueCapacity must be > 0",
        )?;
        ensure(self.heartbeat.tick_ms > 0, "heartbeat.tickMs must be > 0")?;
        ensure(
            self.heartbeat.interval_ms >= self.heartbeat.tick_ms,
            "heartbeat.intervalMs must be >= heartbeat.tickMs",
        )?;
        ensure(
            self.heartbeat.missed_threshold > 0,
            "heartbeat.missedThreshold must be > 0",
        )?;
        ensure(
            self.protocol.max_frame_bytes >= 64,
            "protocol.maxFrameBytes must be >= 64",
        )?;
        ensure(
            self.protocol.max_consecutive_malformed > 0,
            "protocol.maxConsecutiveMalformed must be > 0",
        )?;
        ensure(self.store.max_in_flight > 0, "store.maxInFlight must be > 0")?;
        ensure(self.auth.timeout_ms > 0, "auth.timeoutMs must be > 0")?;
        ensure(
            self.store.session_ttl_ms > self.reconnect.grace_window_ms,
            "store.sessionTtlMs must exceed reconnect.graceWindowMs",
        )?;
        Ok(())
    }
}
