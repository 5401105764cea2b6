//! Message envelope types.

use std::fmt;

use chrono::{DateTime, SubsecRound, Utc};
use serde_json::{Value, json};

/// Message type discriminator.
///
/// Unknown wire values decode to [`MessageType::Generic`] and keep the
/// original string so they re-encode unchanged.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Liveness probe.
    Ping,
    /// Liveness probe answer.
    Pong,
    /// Error report (payload carries `code` and `message`).
    Error,
    /// A user started or stopped typing.
    TypingIndicator,
    /// Presence change for a user.
    PresenceUpdate,
    /// Server-originated notification.
    Notification,
    /// Any other type, forwarded as-is.
    Generic {
        /// Type string as it appeared on the wire.
        kind: String,
    },
}

impl MessageType {
    /// Wire representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::Error => "error",
            Self::TypingIndicator => "typing_indicator",
            Self::PresenceUpdate => "presence_update",
            Self::Notification => "notification",
            Self::Generic { kind } => kind,
        }
    }

    /// Parse a wire type string. Never fails.
    #[must_use]
    pub fn from_wire(s: &str) -> Self {
        match s {
            "ping" => Self::Ping,
            "pong" => Self::Pong,
            "error" => Self::Error,
            "typing_indicator" => Self::TypingIndicator,
            "presence_update" => Self::PresenceUpdate,
            "notification" => Self::Notification,
            other => Self::Generic {
                kind: other.to_owned(),
            },
        }
    }

    /// Whether this is the `generic` fallback.
    #[must_use]
    pub fn is_generic(&self) -> bool {
        matches!(self, Self::Generic { .. })
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Application message envelope.
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    /// Type discriminator.
    pub message_type: MessageType,
    /// Arbitrary JSON payload (`null` when absent).
    pub payload: Value,
    /// Optional request/response correlation.
    pub correlation_id: Option<String>,
    /// Creation time, millisecond precision.
    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// Create a message stamped with the current time.
    pub fn new(message_type: MessageType, payload: Value) -> Self {
        Self {
            message_type,
            payload,
            correlation_id: None,
            timestamp: Utc::now().trunc_subsecs(3),
        }
    }

    /// Attach a correlation ID.
    #[must_use]
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Server heartbeat probe.
    pub fn ping() -> Self {
        Self::new(MessageType::Ping, Value::Null)
    }

    /// Answer to a `ping`, echoing its correlation ID.
    pub fn pong(correlation_id: Option<String>) -> Self {
        Self {
            correlation_id,
            ..Self::new(MessageType::Pong, Value::Null)
        }
    }

    /// `error` message with a machine-readable code.
    pub fn error(
        code: impl Into<String>,
        message: impl Into<String>,
        correlation_id: Option<String>,
    ) -> Self {
        Self {
            correlation_id,
            ..Self::new(
                MessageType::Error,
                json!({ "code": code.into(), "message": message.into() }),
            )
        }
    }

    /// `notification` message carrying `{"event": event, ...data}`.
    ///
    /// Non-object `data` is placed under `data`.
    pub fn notification(event: &str, data: Value) -> Self {
        let payload = match data {
            Value::Object(mut map) => {
                let _ = map.insert("event".into(), Value::String(event.to_owned()));
                Value::Object(map)
            }
            Value::Null => json!({ "event": event }),
            other => json!({ "event": event, "data": other }),
        };
        Self::new(MessageType::Notification, payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_types_round_trip_through_wire_string() {
        for ty in [
            MessageType::Ping,
            MessageType::Pong,
            MessageType::Error,
            MessageType::TypingIndicator,
            MessageType::PresenceUpdate,
            MessageType::Notification,
        ] {
            assert_eq!(MessageType::from_wire(ty.as_str()), ty);
        }
    }

    #[test]
    fn unknown_type_is_generic_and_keeps_kind() {
        let ty = MessageType::from_wire("bogus");
        assert!(ty.is_generic());
        assert_eq!(ty.as_str(), "bogus");
    }

    #[test]
    fn timestamps_are_millisecond_precision() {
        let msg = Message::ping();
        assert_eq!(msg.timestamp.timestamp_subsec_nanos() % 1_000_000, 0);
    }

    #[test]
    fn error_payload_shape() {
        let msg = Message::error("MALFORMED_JSON", "bad", Some("c1".into()));
        assert_eq!(msg.payload["code"], "MALFORMED_JSON");
        assert_eq!(msg.correlation_id.as_deref(), Some("c1"));
    }

    #[test]
    fn notification_merges_event_into_object() {
        let msg = Message::notification("connection.established", json!({"x": 1}));
        assert_eq!(msg.payload["event"], "connection.established");
        assert_eq!(msg.payload["x"], 1);

        let msg = Message::notification("tick", json!(5));
        assert_eq!(msg.payload["data"], 5);
    }
}
