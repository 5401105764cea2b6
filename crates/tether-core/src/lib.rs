//! # tether-core
//!
//! Foundation types shared by every Tether crate:
//!
//! - **Branded IDs**: `ConnectionId`, `SessionId`, `UserId`, `TenantId`,
//!   `InstanceId` as newtypes so one can't be passed where another is expected
//! - **Errors**: the connection/session error taxonomy via `thiserror`, with
//!   stable machine-readable codes
//! - **Retry**: exponential backoff with jitter for external store calls
//! - **Logging**: `tracing` subscriber initialization

#![deny(unsafe_code)]

pub mod errors;
pub mod ids;
pub mod logging;
pub mod retry;

pub use errors::{AuthError, Result, TetherError};
pub use ids::{ConnectionId, InstanceId, SessionId, TenantId, UserId};
