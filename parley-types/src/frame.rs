//! Transport envelope - the outer Engine.IO-style frame.
//!
//! Every frame on the wire is one type digit followed by an opaque
//! payload. Only MESSAGE frames carry a protocol [`Packet`](crate::Packet).

use serde::{Deserialize, Serialize};

use crate::{CodecError, ConnectionId, Packet};

/// Default maximum frame size accepted by either end (1 MiB).
pub const DEFAULT_MAX_PAYLOAD: usize = 1024 * 1024;

/// Transport frame type discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    /// Server handshake carrying session parameters.
    Open = 0,
    /// Transport close.
    Close = 1,
    /// Heartbeat probe.
    Ping = 2,
    /// Heartbeat reply.
    Pong = 3,
    /// Carries a protocol packet.
    Message = 4,
}

impl FrameType {
    /// The ASCII digit written on the wire.
    pub fn digit(self) -> char {
        (b'0' + self as u8) as char
    }
}

impl TryFrom<char> for FrameType {
    type Error = CodecError;

    fn try_from(value: char) -> Result<Self, Self::Error> {
        match value {
            '0' => Ok(FrameType::Open),
            '1' => Ok(FrameType::Close),
            '2' => Ok(FrameType::Ping),
            '3' => Ok(FrameType::Pong),
            '4' => Ok(FrameType::Message),
            other => Err(CodecError::UnknownFrameType(other)),
        }
    }
}

/// One transport frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame type.
    pub frame_type: FrameType,
    /// Opaque payload following the type digit.
    pub payload: String,
}

impl Frame {
    /// Create a frame with an arbitrary payload.
    pub fn new(frame_type: FrameType, payload: impl Into<String>) -> Self {
        Self {
            frame_type,
            payload: payload.into(),
        }
    }

    /// OPEN frame carrying the JSON handshake.
    pub fn open(handshake: &OpenHandshake) -> Self {
        // Serializing a struct of strings and integers cannot fail.
        let payload = serde_json::to_string(handshake).unwrap_or_default();
        Self::new(FrameType::Open, payload)
    }

    /// Empty CLOSE frame.
    pub fn close() -> Self {
        Self::new(FrameType::Close, "")
    }

    /// Empty PING frame.
    pub fn ping() -> Self {
        Self::new(FrameType::Ping, "")
    }

    /// PONG frame echoing the probe payload of a PING.
    pub fn pong(echo: impl Into<String>) -> Self {
        Self::new(FrameType::Pong, echo)
    }

    /// MESSAGE frame wrapping an encoded protocol packet.
    pub fn message(packet: &Packet) -> Self {
        Self::new(FrameType::Message, packet.encode())
    }

    /// Encode to the wire representation.
    pub fn encode(&self) -> String {
        let mut out = String::with_capacity(self.payload.len() + 1);
        out.push(self.frame_type.digit());
        out.push_str(&self.payload);
        out
    }

    /// Decode a frame, rejecting anything larger than `max_payload` bytes.
    pub fn decode(raw: &str, max_payload: usize) -> Result<Self, CodecError> {
        if raw.len() > max_payload {
            return Err(CodecError::TooLarge {
                size: raw.len(),
                limit: max_payload,
            });
        }
        let mut chars = raw.chars();
        let digit = chars.next().ok_or(CodecError::Empty)?;
        let frame_type = FrameType::try_from(digit)?;
        Ok(Self {
            frame_type,
            payload: chars.as_str().to_string(),
        })
    }

    /// Decode the inner protocol packet of a MESSAGE frame.
    ///
    /// Returns `None` for non-MESSAGE frames.
    pub fn packet(&self) -> Option<Result<Packet, CodecError>> {
        match self.frame_type {
            FrameType::Message => Some(Packet::decode(&self.payload)),
            _ => None,
        }
    }

    /// Parse the handshake of an OPEN frame.
    pub fn handshake(&self) -> Result<OpenHandshake, CodecError> {
        if self.frame_type != FrameType::Open {
            return Err(CodecError::InvalidPayload("not an OPEN frame".into()));
        }
        serde_json::from_str(&self.payload).map_err(|e| CodecError::InvalidJson(e.to_string()))
    }
}

/// Session parameters announced by the server in the OPEN frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenHandshake {
    /// Session id (equals the connection id).
    pub sid: ConnectionId,
    /// Transport upgrades offered (always empty, WebSocket only).
    #[serde(default)]
    pub upgrades: Vec<String>,
    /// Client heartbeat interval in milliseconds.
    pub ping_interval: u64,
    /// Idle timeout in milliseconds after which the peer is considered dead.
    pub ping_timeout: u64,
    /// Maximum accepted frame size in bytes.
    pub max_payload: usize,
}
