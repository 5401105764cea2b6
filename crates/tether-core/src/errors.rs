//! Error taxonomy for the connection/session core.
//!
//! [`TetherError`] is what operations on the connection manager and the
//! reconnection coordinator return. Each variant maps to a stable,
//! machine-readable code (see the constants below) that is sent to clients
//! in `error` messages and close frames.
//!
//! Terminal vs. recoverable:
//! - [`AuthError`], heartbeat timeout, and protocol abuse always end the
//!   connection.
//! - Ownership conflicts are surfaced to the resume caller, never retried.
//! - Store unavailability is retried by the store wrapper and otherwise
//!   degrades the connection to local-only mode.

use std::time::Duration;

use thiserror::Error;

use crate::ids::{ConnectionId, SessionId};

// ── Error code constants ────────────────────────────────────────────

/// Handshake or resume rejected by the auth gate.
pub const AUTH_FAILED: &str = "AUTH_FAILED";
/// Target connection does not exist (or is already closed).
pub const CONNECTION_NOT_FOUND: &str = "CONNECTION_NOT_FOUND";
/// Connection stopped answering heartbeat probes.
pub const HEARTBEAT_TIMEOUT: &str = "HEARTBEAT_TIMEOUT";
/// Grace window for resuming the session has elapsed.
pub const RECONNECTION_WINDOW_EXPIRED: &str = "RECONNECTION_WINDOW_EXPIRED";
/// Another instance or attempt won the session's fencing epoch.
pub const SESSION_OWNERSHIP_CONFLICT: &str = "SESSION_OWNERSHIP_CONFLICT";
/// Malformed message.
pub const PROTOCOL_ERROR: &str = "PROTOCOL_ERROR";
/// External session store unreachable.
pub const SESSION_STORE_UNAVAILABLE: &str = "SESSION_STORE_UNAVAILABLE";
/// Admission limit reached.
pub const CAPACITY_EXCEEDED: &str = "CAPACITY_EXCEEDED";
/// Unexpected internal failure.
pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";

/// Authentication failures reported by (or while calling) the auth gate.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    /// The token was understood and refused.
    #[error("token rejected: {0}")]
    Rejected(String),

    /// The auth gate did not answer within the configured bound.
    #[error("auth gate timed out after {0:?}")]
    Timeout(Duration),

    /// The auth gate could not be reached.
    #[error("auth gate unavailable: {0}")]
    Unavailable(String),

    /// The resume token is malformed, forged, expired, or for another session.
    #[error("invalid resume token: {0}")]
    InvalidResumeToken(String),

    /// No bearer token was presented.
    #[error("missing bearer token")]
    MissingToken,
}

/// Top-level error type for connection and session operations.
#[derive(Debug, Error)]
pub enum TetherError {
    /// Handshake/resume rejected.
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// `send`/`disconnect` target missing.
    #[error("connection not found: {0}")]
    ConnectionNotFound(ConnectionId),

    /// Internal-only; always terminal for the connection.
    #[error("heartbeat timeout on connection {0}")]
    HeartbeatTimeout(ConnectionId),

    /// Resume attempted after the grace window closed.
    #[error("reconnection window expired for session {0}")]
    ReconnectionWindowExpired(SessionId),

    /// Fencing epoch lost a race (or the resume token is from an old epoch).
    #[error("session {session_id} is owned at epoch {current_epoch}")]
    SessionOwnershipConflict {
        /// The contested session.
        session_id: SessionId,
        /// Epoch held by the current owner.
        current_epoch: u64,
    },

    /// Malformed inbound message.
    #[error("protocol error [{code}]: {message}")]
    Protocol {
        /// Machine-readable reason (e.g. `MALFORMED_JSON`).
        code: String,
        /// Human-readable detail.
        message: String,
    },

    /// External session store unreachable after retries.
    #[error("session store unavailable: {0}")]
    SessionStoreUnavailable(String),

    /// Connection admission limit reached.
    #[error("connection limit of {0} reached")]
    CapacityExceeded(usize),

    /// Anything else.
    #[error("internal error: {0}")]
    Internal(String),
}

impl TetherError {
    /// Machine-readable error code for this variant.
    #[must_use]
    pub fn code(&self) -> &str {
        match self {
            Self::Auth(_) => AUTH_FAILED,
            Self::ConnectionNotFound(_) => CONNECTION_NOT_FOUND,
            Self::HeartbeatTimeout(_) => HEARTBEAT_TIMEOUT,
            Self::ReconnectionWindowExpired(_) => RECONNECTION_WINDOW_EXPIRED,
            Self::SessionOwnershipConflict { .. } => SESSION_OWNERSHIP_CONFLICT,
            Self::Protocol { .. } => PROTOCOL_ERROR,
            Self::SessionStoreUnavailable(_) => SESSION_STORE_UNAVAILABLE,
            Self::CapacityExceeded(_) => CAPACITY_EXCEEDED,
            Self::Internal(_) => INTERNAL_ERROR,
        }
    }

    /// Whether the error ends the connection it occurred on.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Auth(_) | Self::HeartbeatTimeout(_) | Self::CapacityExceeded(_)
        )
    }
}

/// Convenience result alias.
pub type Result<T> = std::result::Result<T, TetherError>;

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn codes_are_stable() {
        let cases: Vec<(TetherError, &str)> = vec![
            (AuthError::MissingToken.into(), AUTH_FAILED),
            (
                TetherError::ConnectionNotFound("c1".into()),
                CONNECTION_NOT_FOUND,
            ),
            (TetherError::HeartbeatTimeout("c1".into()), HEARTBEAT_TIMEOUT),
            (
                TetherError::ReconnectionWindowExpired("s1".into()),
                RECONNECTION_WINDOW_EXPIRED,
            ),
            (
                TetherError::SessionOwnershipConflict {
                    session_id: "s1".into(),
                    current_epoch: 4,
                },
                SESSION_OWNERSHIP_CONFLICT,
            ),
            (
                TetherError::SessionStoreUnavailable("down".into()),
                SESSION_STORE_UNAVAILABLE,
            ),
        ];
        for (err, code) in cases {
            assert_eq!(err.code(), code);
        }
    }

    #[test]
    fn auth_and_heartbeat_are_terminal() {
        assert!(TetherError::from(AuthError::Rejected("bad".into())).is_terminal());
        assert!(TetherError::HeartbeatTimeout("c".into()).is_terminal());
        assert!(
            !TetherError::SessionOwnershipConflict {
                session_id: "s".into(),
                current_epoch: 1
            }
            .is_terminal()
        );
    }

    #[test]
    fn auth_error_converts() {
        let err: TetherError = AuthError::Timeout(Duration::from_secs(2)).into();
        assert_matches!(err, TetherError::Auth(AuthError::Timeout(_)));
    }

    #[test]
    fn display_includes_epoch() {
        let err = TetherError::SessionOwnershipConflict {
            session_id: "sess_x".into(),
            current_epoch: 7,
        };
        assert_eq!(err.to_string(), "session sess_x is owned at epoch 7");
    }
}
