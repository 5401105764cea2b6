//! # tether-protocol
//!
//! Application message envelope shared by clients and the server.
//!
//! - [`Message`] / [`MessageType`]: closed tagged union with a `generic`
//!   fallback that keeps unknown type strings
//! - [`ProtocolCodec`]: JSON encode/decode with a frame size limit and
//!   machine-readable rejection reasons
//! - [`CloseReason`]: termination reasons and their WebSocket close codes

#![deny(unsafe_code)]

pub mod close;
pub mod codec;
pub mod message;

pub use close::CloseReason;
pub use codec::{DEFAULT_MAX_FRAME_BYTES, ProtocolCodec, ProtocolError};
pub use message::{Message, MessageType};
