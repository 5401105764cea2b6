//! Error types for session stores.
//!
//! [`StoreError::is_transient`] decides what the resilient wrapper retries:
//! only failures that might succeed on a second attempt. `NotFound` and
//! `Fenced` are answers, not failures.

use std::time::Duration;

use rusqlite::ErrorCode;
use tether_core::{SessionId, TetherError};
use thiserror::Error;

/// Errors returned by [`SessionStore`](crate::SessionStore) operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No (unexpired) record for this session.
    #[error("session not found: {0}")]
    NotFound(SessionId),

    /// Write carried an epoch older than the stored one.
    #[error("write to session {session_id} fenced: stored epoch {stored_epoch}, attempted {attempted_epoch}")]
    Fenced {
        /// Target session.
        session_id: SessionId,
        /// Epoch currently stored.
        stored_epoch: u64,
        /// Epoch the writer held.
        attempted_epoch: u64,
    },

    /// Call exceeded its timeout.
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),

    /// Circuit breaker is open; the call was not attempted.
    #[error("store circuit open")]
    CircuitOpen,

    /// Backend unreachable.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// `SQLite` error.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Connection pool error.
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    /// Record (de)serialization failed.
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Migration failed.
    #[error("migration error: {message}")]
    Migration {
        /// What failed.
        message: String,
    },

    /// Internal error (e.g. a blocking task panicked).
    #[error("internal error: {0}")]
    Internal(String),
}

impl StoreError {
    /// Whether retrying the same call might succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::Unavailable(_) | Self::Pool(_) => true,
            Self::Sqlite(e) => matches!(
                e.sqlite_error_code(),
                Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked | ErrorCode::SystemIoFailure)
            ),
            _ => false,
        }
    }

    /// Whether the store could not answer at all (transient failure or open
    /// breaker), as opposed to answering with `NotFound`/`Fenced`.
    pub fn is_outage(&self) -> bool {
        self.is_transient() || matches!(self, Self::CircuitOpen)
    }
}

impl From<StoreError> for TetherError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Fenced {
                session_id,
                stored_epoch,
                ..
            } => Self::SessionOwnershipConflict {
                session_id,
                current_epoch: stored_epoch,
            },
            e @ (StoreError::Timeout(_)
            | StoreError::CircuitOpen
            | StoreError::Unavailable(_)
            | StoreError::Sqlite(_)
            | StoreError::Pool(_)) => Self::SessionStoreUnavailable(e.to_string()),
            other => Self::Internal(other.to_string()),
        }
    }
}

/// Convenience type alias for store results.
pub type Result<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn answers_are_not_transient() {
        assert!(!StoreError::NotFound("s".into()).is_transient());
        assert!(
            !StoreError::Fenced {
                session_id: "s".into(),
                stored_epoch: 2,
                attempted_epoch: 1
            }
            .is_transient()
        );
        assert!(!StoreError::CircuitOpen.is_transient());
        assert!(StoreError::CircuitOpen.is_outage());
        assert!(!StoreError::NotFound("s".into()).is_outage());
    }

    #[test]
    fn io_failures_are_transient() {
        assert!(StoreError::Timeout(Duration::from_millis(5)).is_transient());
        assert!(StoreError::Unavailable("down".into()).is_transient());
        let busy = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        );
        assert!(StoreError::Sqlite(busy).is_transient());
        assert!(!StoreError::Sqlite(rusqlite::Error::QueryReturnedNoRows).is_transient());
    }

    #[test]
    fn fenced_maps_to_ownership_conflict() {
        let err: TetherError = StoreError::Fenced {
            session_id: "s".into(),
            stored_epoch: 4,
            attempted_epoch: 3,
        }
        .into();
        assert_matches!(
            err,
            TetherError::SessionOwnershipConflict {
                current_epoch: 4,
                ..
            }
        );
    }

    #[test]
    fn outages_map_to_store_unavailable() {
        let err: TetherError = StoreError::CircuitOpen.into();
        assert_matches!(err, TetherError::SessionStoreUnavailable(_));
    }
}
