//! # tether-server
//!
//! Connection and session management around a WebSocket transport.
//!
//! - [`manager::ConnectionManager`]: sharded registry, send/broadcast,
//!   disconnect, inbound handling, admission limit
//! - [`heartbeat::HeartbeatMonitor`]: shared time-wheel of liveness probes
//! - [`reconnect::ReconnectionCoordinator`]: grace window and fenced resume
//! - [`auth`]: the `AuthGate` seam, an HS256 JWT adapter, resume tokens
//! - [`metrics::MetricsCollector`]: pull-based counters/gauges, mirrored to
//!   the `metrics` facade
//! - [`server::TetherServer`]: Axum router (`/health`, `/metrics`, `/ws`)
//! - Graceful shutdown via `CancellationToken`

#![deny(unsafe_code)]

pub mod auth;
pub mod connection;
pub mod health;
pub mod heartbeat;
pub mod manager;
pub mod metrics;
pub mod reconnect;
pub mod server;
pub mod shutdown;
pub mod websocket;

pub use auth::{AuthClaims, AuthGate, JwtAuthGate, ResumeGrant, ResumeTokenSigner};
pub use connection::{Connection, ConnectionState};
pub use heartbeat::{HeartbeatMonitor, SweepOutcome};
pub use manager::{BroadcastTarget, ConnectionManager, ManagerConfig, Registration};
pub use self::metrics::MetricsCollector;
pub use reconnect::ReconnectionCoordinator;
pub use server::TetherServer;
pub use shutdown::ShutdownCoordinator;
