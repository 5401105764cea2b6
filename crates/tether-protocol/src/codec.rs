//! JSON wire codec for [`Message`].
//!
//! Wire shape, fields in this order:
//!
//! ```json
//! {"type":"ping","payload":null,"correlation_id":"c1","timestamp":"2024-01-01T00:00:00.000Z"}
//! ```
//!
//! `correlation_id` is omitted when absent. Encoding is canonical (compact,
//! millisecond RFC 3339 UTC timestamps), so `encode(decode(b)) == b` holds
//! for any `b` the codec itself produced. Inbound timestamps are truncated
//! to milliseconds on decode, so `decode(encode(m)) == m` for every decoded
//! `m`.

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde::Serialize;
use serde_json::Value;
use tether_core::TetherError;
use thiserror::Error;

use crate::message::{Message, MessageType};

/// Default maximum inbound frame size (64 KiB).
pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024;

/// Reason code: input is not valid JSON.
pub const MALFORMED_JSON: &str = "MALFORMED_JSON";
/// Reason code: no usable `type` field.
pub const MISSING_TYPE: &str = "MISSING_TYPE";
/// Reason code: a known field has the wrong shape.
pub const INVALID_FIELD: &str = "INVALID_FIELD";
/// Reason code: frame exceeds the configured limit.
pub const FRAME_TOO_LARGE: &str = "FRAME_TOO_LARGE";
/// Reason code: the message could not be serialized.
pub const ENCODE_FAILED: &str = "ENCODE_FAILED";

/// Decode/encode failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// Frame exceeds `max_frame_bytes`.
    #[error("frame of {size} bytes exceeds limit of {max}")]
    FrameTooLarge {
        /// Received size.
        size: usize,
        /// Configured limit.
        max: usize,
    },

    /// Not parseable as JSON.
    #[error("malformed JSON: {0}")]
    MalformedJson(String),

    /// No `type` field, or an empty one.
    #[error("message has no type")]
    MissingType,

    /// A field is present with the wrong shape.
    #[error("invalid field `{field}`: {reason}")]
    InvalidField {
        /// Offending field name.
        field: &'static str,
        /// What was wrong.
        reason: String,
    },

    /// Serialization failed.
    #[error("encode failed: {0}")]
    Encode(String),
}

impl ProtocolError {
    /// Machine-readable reason code sent back in `error` messages.
    #[must_use]
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::FrameTooLarge { .. } => FRAME_TOO_LARGE,
            Self::MalformedJson(_) => MALFORMED_JSON,
            Self::MissingType => MISSING_TYPE,
            Self::InvalidField { .. } => INVALID_FIELD,
            Self::Encode(_) => ENCODE_FAILED,
        }
    }
}

impl From<ProtocolError> for TetherError {
    fn from(err: ProtocolError) -> Self {
        Self::Protocol {
            code: err.reason_code().to_owned(),
            message: err.to_string(),
        }
    }
}

/// Borrowing view serialized in envelope field order.
#[derive(Serialize)]
struct WireMessage<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    payload: &'a Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    correlation_id: Option<&'a str>,
    timestamp: String,
}

/// Stateless message codec with a frame size limit.
#[derive(Clone, Copy, Debug)]
pub struct ProtocolCodec {
    max_frame_bytes: usize,
}

impl Default for ProtocolCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl ProtocolCodec {
    /// Create a codec accepting frames up to `max_frame_bytes`.
    #[must_use]
    pub fn new(max_frame_bytes: usize) -> Self {
        Self { max_frame_bytes }
    }

    /// Configured frame limit.
    #[must_use]
    pub fn max_frame_bytes(&self) -> usize {
        self.max_frame_bytes
    }

    /// Encode a message to canonical JSON bytes.
    pub fn encode(&self, msg: &Message) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(&wire(msg)).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    /// Encode a message to a JSON string (for text frames).
    pub fn encode_text(&self, msg: &Message) -> Result<String, ProtocolError> {
        serde_json::to_string(&wire(msg)).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    /// Decode one frame.
    pub fn decode(&self, bytes: &[u8]) -> Result<Message, ProtocolError> {
        if bytes.len() > self.max_frame_bytes {
            return Err(ProtocolError::FrameTooLarge {
                size: bytes.len(),
                max: self.max_frame_bytes,
            });
        }

        let value: Value =
            serde_json::from_slice(bytes).map_err(|e| ProtocolError::MalformedJson(e.to_string()))?;
        let Value::Object(mut obj) = value else {
            return Err(ProtocolError::MalformedJson(
                "top-level value must be an object".into(),
            ));
        };

        let message_type = match obj.remove("type") {
            None | Some(Value::Null) => return Err(ProtocolError::MissingType),
            Some(Value::String(s)) if s.is_empty() => return Err(ProtocolError::MissingType),
            Some(Value::String(s)) => MessageType::from_wire(&s),
            Some(other) => {
                return Err(ProtocolError::InvalidField {
                    field: "type",
                    reason: format!("expected string, got {}", json_kind(&other)),
                });
            }
        };

        let payload = obj.remove("payload").unwrap_or(Value::Null);

        let correlation_id = match obj.remove("correlation_id") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s),
            Some(other) => {
                return Err(ProtocolError::InvalidField {
                    field: "correlation_id",
                    reason: format!("expected string, got {}", json_kind(&other)),
                });
            }
        };

        // Clients may omit the timestamp; stamp on receipt.
        let timestamp = match obj.remove("timestamp") {
            None | Some(Value::Null) => Utc::now().trunc_subsecs(3),
            Some(Value::String(s)) => DateTime::parse_from_rfc3339(&s)
                .map(|t| t.with_timezone(&Utc).trunc_subsecs(3))
                .map_err(|e| ProtocolError::InvalidField {
                    field: "timestamp",
                    reason: e.to_string(),
                })?,
            Some(other) => {
                return Err(ProtocolError::InvalidField {
                    field: "timestamp",
                    reason: format!("expected string, got {}", json_kind(&other)),
                });
            }
        };

        Ok(Message {
            message_type,
            payload,
            correlation_id,
            timestamp,
        })
    }
}

fn wire(msg: &Message) -> WireMessage<'_> {
    WireMessage {
        kind: msg.message_type.as_str(),
        payload: &msg.payload,
        correlation_id: msg.correlation_id.as_deref(),
        timestamp: msg.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
    }
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
