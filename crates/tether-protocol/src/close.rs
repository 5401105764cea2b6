//! Connection termination reasons.
//!
//! Each reason has a stable string code (sent in the close frame reason and
//! logged as the `reason` metric label) and a WebSocket close code. Standard
//! codes are used where one fits; application reasons use the 4000 range.

use std::fmt;
use std::str::FromStr;

/// Why a connection was (or is being) closed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CloseReason {
    /// Orderly close requested by the client.
    Normal,
    /// Transport dropped without an orderly close.
    GoingAway,
    /// Malformed-message threshold exceeded.
    ProtocolViolation,
    /// Unexpected server-side failure.
    InternalError,
    /// Instance is shutting down.
    ServerShutdown,
    /// Heartbeat probes went unanswered.
    HeartbeatTimeout,
    /// A newer connection took over the session (fenced).
    SessionReplaced,
    /// Authentication failed or was revoked.
    AuthFailed,
    /// Connection limit reached.
    CapacityExceeded,
}

impl CloseReason {
    /// All reasons.
    pub const ALL: [Self; 9] = [
        Self::Normal,
        Self::GoingAway,
        Self::ProtocolViolation,
        Self::InternalError,
        Self::ServerShutdown,
        Self::HeartbeatTimeout,
        Self::SessionReplaced,
        Self::AuthFailed,
        Self::CapacityExceeded,
    ];

    /// Machine-readable reason code.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "NORMAL_CLOSURE",
            Self::GoingAway => "GOING_AWAY",
            Self::ProtocolViolation => "PROTOCOL_VIOLATION",
            Self::InternalError => "INTERNAL_ERROR",
            Self::ServerShutdown => "SERVER_SHUTDOWN",
            Self::HeartbeatTimeout => "HEARTBEAT_TIMEOUT",
            Self::SessionReplaced => "SESSION_REPLACED",
            Self::AuthFailed => "AUTH_FAILED",
            Self::CapacityExceeded => "CAPACITY_EXCEEDED",
        }
    }

    /// WebSocket close code.
    #[must_use]
    pub fn close_code(self) -> u16 {
        match self {
            Self::Normal => 1000,
            Self::GoingAway | Self::ServerShutdown => 1001,
            Self::ProtocolViolation => 1008,
            Self::InternalError => 1011,
            Self::CapacityExceeded => 1013,
            Self::HeartbeatTimeout => 4000,
            Self::SessionReplaced => 4001,
            Self::AuthFailed => 4003,
        }
    }

    /// Human-readable text for the close frame.
    #[must_use]
    pub fn description(self) -> &'static str {
        match self {
            Self::Normal => "connection closed",
            Self::GoingAway => "connection lost",
            Self::ProtocolViolation => "too many malformed messages",
            Self::InternalError => "internal server error",
            Self::ServerShutdown => "server shutting down",
            Self::HeartbeatTimeout => "heartbeat timeout",
            Self::SessionReplaced => "session taken over by another connection",
            Self::AuthFailed => "authentication failed",
            Self::CapacityExceeded => "server at capacity",
        }
    }

    /// Whether the session should wait in a grace window for a resume.
    ///
    /// Only involuntary losses qualify. A client that closed on purpose,
    /// was rejected, or was replaced has nothing to resume.
    #[must_use]
    pub fn allows_resume(self) -> bool {
        matches!(
            self,
            Self::GoingAway | Self::ServerShutdown | Self::HeartbeatTimeout | Self::InternalError
        )
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CloseReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| format!("unknown close reason: {s}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_parse_back() {
        for reason in CloseReason::ALL {
            assert_eq!(reason.as_str().parse::<CloseReason>(), Ok(reason));
        }
        assert!("NOPE".parse::<CloseReason>().is_err());
    }

    #[test]
    fn application_codes_are_in_private_range() {
        for reason in [
            CloseReason::HeartbeatTimeout,
            CloseReason::SessionReplaced,
            CloseReason::AuthFailed,
        ] {
            assert!((4000..5000).contains(&reason.close_code()));
        }
        assert_eq!(CloseReason::Normal.close_code(), 1000);
        assert_eq!(CloseReason::ProtocolViolation.close_code(), 1008);
    }

    #[test]
    fn only_involuntary_losses_allow_resume() {
        assert!(CloseReason::GoingAway.allows_resume());
        assert!(CloseReason::HeartbeatTimeout.allows_resume());
        assert!(!CloseReason::Normal.allows_resume());
        assert!(!CloseReason::AuthFailed.allows_resume());
        assert!(!CloseReason::SessionReplaced.allows_resume());
        assert!(!CloseReason::ProtocolViolation.allows_resume());
    }
}
