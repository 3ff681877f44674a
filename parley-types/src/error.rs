//! Error types for Parley.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A frame or packet could not be decoded.
///
/// Decoding errors are always local to one frame: the receiver drops the
/// frame and keeps the connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// Frame carried no bytes at all.
    #[error("empty frame")]
    Empty,

    /// Leading transport digit is not one of OPEN/CLOSE/PING/PONG/MESSAGE.
    #[error("unknown transport frame type: {0:?}")]
    UnknownFrameType(char),

    /// Leading protocol digit is not one of CONNECT..CONNECT_ERROR.
    #[error("unknown packet type: {0:?}")]
    UnknownPacketType(char),

    /// Namespace segment is not terminated or contains illegal characters.
    #[error("invalid namespace: {0}")]
    InvalidNamespace(String),

    /// Ack id does not fit in a u64.
    #[error("invalid ack id: {0}")]
    InvalidAckId(String),

    /// Payload is not valid JSON.
    #[error("invalid JSON payload: {0}")]
    InvalidJson(String),

    /// Payload is JSON but has the wrong shape for its packet type.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// Event name is not part of the closed event set.
    #[error("unknown event: {0}")]
    UnknownEvent(String),

    /// Frame exceeds the negotiated maximum payload.
    #[error("frame too large: {size} bytes (limit: {limit} bytes)")]
    TooLarge {
        /// Actual size of the frame.
        size: usize,
        /// Maximum allowed size.
        limit: usize,
    },
}

/// Error categories carried in negative ack replies and CONNECT_ERROR packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Missing or invalid credentials.
    Auth,
    /// The referenced conversation does not exist for this app/device.
    ConversationNotFound,
    /// Per-connection or global rate limit exceeded.
    RateLimited,
    /// Request was well-formed on the wire but semantically invalid.
    InvalidRequest,
    /// Server-side failure (storage, serialization).
    Internal,
}

/// Error reported by the remote end, decoded from the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{kind:?}: {message}")]
pub struct RemoteError {
    /// Error category.
    pub kind: ErrorKind,
    /// Human-readable detail.
    pub message: String,
}

impl RemoteError {
    /// Create a remote error with the given kind and message.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}
