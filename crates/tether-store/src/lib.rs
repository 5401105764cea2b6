//! # tether-store
//!
//! Durable record of session ownership and state, shared across instances.
//!
//! - [`Session`]: the stored entity, including the fencing epoch
//! - [`SessionStore`]: `save` / `load` / `claim` / `touch` / `expire_sweep`
//! - [`MemorySessionStore`]: `DashMap`-backed, single process
//! - [`SqliteSessionStore`]: `r2d2` pool over a shared database file
//! - [`ResilientStore`]: timeout, retry, bulkhead, and circuit breaker around
//!   any store
//!
//! Ownership changes only through [`SessionStore::claim`], an atomic
//! compare-and-swap on the stored epoch. Writes carrying an older epoch are
//! refused with [`StoreError::Fenced`].

#![deny(unsafe_code)]

pub mod errors;
pub mod memory;
pub mod resilient;
pub mod session;
pub mod sqlite;
pub mod store;

pub use errors::{Result, StoreError};
pub use memory::MemorySessionStore;
pub use resilient::{CircuitState, ResilienceConfig, ResilientStore};
pub use session::{ClaimOutcome, Session, SessionStatus};
pub use sqlite::SqliteSessionStore;
pub use store::SessionStore;
