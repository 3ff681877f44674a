//! Protocol packets - the Socket.IO-style layer inside MESSAGE frames.
//!
//! Grammar: `TYPE_DIGIT ["/" NAMESPACE ","] [ACK_ID] [JSON]`.
//!
//! The default namespace `/` is never written out. The decoder also accepts
//! a bare comma before the ack id (`2,7[...]`), which some clients emit.

use serde_json::Value;
use std::fmt::Write as _;

use crate::CodecError;

/// Path of the default (end-user) namespace.
pub const DEFAULT_NAMESPACE: &str = "/";

/// Path of the operator namespace.
pub const ADMIN_NAMESPACE: &str = "/admin";

/// Protocol packet type discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    /// Namespace connect request / confirmation.
    Connect = 0,
    /// Namespace disconnect.
    Disconnect = 1,
    /// Named event with arguments.
    Event = 2,
    /// Reply to an event carrying an ack id.
    Ack = 3,
    /// Namespace connect refused.
    ConnectError = 4,
}

impl PacketType {
    /// The ASCII digit written on the wire.
    pub fn digit(self) -> char {
        (b'0' + self as u8) as char
    }
}

impl TryFrom<char> for PacketType {
    type Error = CodecError;

    fn try_from(value: char) -> Result<Self, Self::Error> {
        match value {
            '0' => Ok(PacketType::Connect),
            '1' => Ok(PacketType::Disconnect),
            '2' => Ok(PacketType::Event),
            '3' => Ok(PacketType::Ack),
            '4' => Ok(PacketType::ConnectError),
            other => Err(CodecError::UnknownPacketType(other)),
        }
    }
}

/// The two logical namespaces sharing the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    /// End-user client connections (`/`).
    Client,
    /// Operator / admin dashboard connections (`/admin`).
    Admin,
}

impl Namespace {
    /// Wire path of the namespace.
    pub fn path(self) -> &'static str {
        match self {
            Namespace::Client => DEFAULT_NAMESPACE,
            Namespace::Admin => ADMIN_NAMESPACE,
        }
    }

    /// Resolve a wire path, returning `None` for unknown namespaces.
    pub fn from_path(path: &str) -> Option<Self> {
        match path {
            DEFAULT_NAMESPACE => Some(Namespace::Client),
            ADMIN_NAMESPACE => Some(Namespace::Admin),
            _ => None,
        }
    }
}

impl std::fmt::Display for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.path())
    }
}

/// One protocol packet.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    /// Packet type.
    pub packet_type: PacketType,
    /// Namespace path, always starting with `/`.
    pub namespace: String,
    /// Correlation id for EVENT (request) and ACK (reply) packets.
    pub ack_id: Option<u64>,
    /// JSON payload: array for EVENT/ACK, object for CONNECT/CONNECT_ERROR.
    pub data: Option<Value>,
}

impl Packet {
    /// CONNECT packet, optionally carrying an auth object (client) or `{"sid"}` (server).
    pub fn connect(namespace: Namespace, data: Option<Value>) -> Self {
        Self {
            packet_type: PacketType::Connect,
            namespace: namespace.path().to_string(),
            ack_id: None,
            data,
        }
    }

    /// CONNECT_ERROR packet with a human-readable reason.
    pub fn connect_error(namespace: &str, message: &str) -> Self {
        Self {
            packet_type: PacketType::ConnectError,
            namespace: namespace.to_string(),
            ack_id: None,
            data: Some(serde_json::json!({ "message": message })),
        }
    }

    /// DISCONNECT packet.
    pub fn disconnect(namespace: Namespace) -> Self {
        Self {
            packet_type: PacketType::Disconnect,
            namespace: namespace.path().to_string(),
            ack_id: None,
            data: None,
        }
    }

    /// EVENT packet `[name, ...args]`, optionally requesting an ack.
    pub fn event(namespace: Namespace, name: &str, args: Vec<Value>, ack_id: Option<u64>) -> Self {
        let mut array = Vec::with_capacity(args.len() + 1);
        array.push(Value::String(name.to_string()));
        array.extend(args);
        Self {
            packet_type: PacketType::Event,
            namespace: namespace.path().to_string(),
            ack_id,
            data: Some(Value::Array(array)),
        }
    }

    /// ACK packet replying to `ack_id`.
    pub fn ack(namespace: &str, ack_id: u64, args: Vec<Value>) -> Self {
        Self {
            packet_type: PacketType::Ack,
            namespace: namespace.to_string(),
            ack_id: Some(ack_id),
            data: Some(Value::Array(args)),
        }
    }

    /// Event name of an EVENT packet.
    pub fn event_name(&self) -> Option<&str> {
        match (&self.packet_type, &self.data) {
            (PacketType::Event, Some(Value::Array(items))) => items.first()?.as_str(),
            _ => None,
        }
    }

    /// Arguments following the event name (EVENT) or the reply values (ACK).
    pub fn args(&self) -> &[Value] {
        match (&self.packet_type, &self.data) {
            (PacketType::Event, Some(Value::Array(items))) if !items.is_empty() => &items[1..],
            (PacketType::Ack, Some(Value::Array(items))) => items,
            _ => &[],
        }
    }

    /// Encode to the wire representation (without the transport digit).
    pub fn encode(&self) -> String {
        let mut out = String::new();
        out.push(self.packet_type.digit());
        if self.namespace != DEFAULT_NAMESPACE {
            out.push_str(&self.namespace);
            out.push(',');
        }
        if let Some(id) = self.ack_id {
            let _ = write!(out, "{id}");
        }
        if let Some(data) = &self.data {
            out.push_str(&data.to_string());
        }
        out
    }

    /// Decode a packet. Total: never panics, any malformed input is an error.
    pub fn decode(raw: &str) -> Result<Self, CodecError> {
        let digit = raw.chars().next().ok_or(CodecError::Empty)?;
        let packet_type = PacketType::try_from(digit)?;
        let mut rest = &raw[digit.len_utf8()..];

        let namespace = if rest.starts_with('/') {
            let (ns, tail) = match rest.find(',') {
                Some(idx) => (&rest[..idx], &rest[idx + 1..]),
                None => (rest, ""),
            };
            validate_namespace(ns)?;
            rest = tail;
            ns.to_string()
        } else {
            if let Some(tail) = rest.strip_prefix(',') {
                rest = tail;
            }
            DEFAULT_NAMESPACE.to_string()
        };

        let digits = rest
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(rest.len());
        let ack_id = if digits > 0 {
            let id = rest[..digits]
                .parse::<u64>()
                .map_err(|_| CodecError::InvalidAckId(rest[..digits].to_string()))?;
            Some(id)
        } else {
            None
        };
        rest = &rest[digits..];

        let data = if rest.is_empty() {
            None
        } else {
            Some(
                serde_json::from_str::<Value>(rest)
                    .map_err(|e| CodecError::InvalidJson(e.to_string()))?,
            )
        };

        let packet = Self {
            packet_type,
            namespace,
            ack_id,
            data,
        };
        packet.validate()?;
        Ok(packet)
    }

    fn validate(&self) -> Result<(), CodecError> {
        let invalid = |reason: &str| Err(CodecError::InvalidPayload(reason.to_string()));
        match self.packet_type {
            PacketType::Event => match &self.data {
                Some(Value::Array(items)) if matches!(items.first(), Some(Value::String(_))) => {
                    Ok(())
                }
                _ => invalid("EVENT payload must be an array starting with the event name"),
            },
            PacketType::Ack => match (&self.ack_id, &self.data) {
                (Some(_), Some(Value::Array(_))) => Ok(()),
                (None, _) => invalid("ACK without ack id"),
                _ => invalid("ACK payload must be an array"),
            },
            PacketType::Connect => match (&self.ack_id, &self.data) {
                (Some(_), _) => invalid("CONNECT cannot carry an ack id"),
                (None, None | Some(Value::Object(_))) => Ok(()),
                _ => invalid("CONNECT payload must be an object"),
            },
            PacketType::ConnectError => match (&self.ack_id, &self.data) {
                (Some(_), _) => invalid("CONNECT_ERROR cannot carry an ack id"),
                (None, None | Some(Value::Object(_))) => Ok(()),
                _ => invalid("CONNECT_ERROR payload must be an object"),
            },
            PacketType::Disconnect => match (&self.ack_id, &self.data) {
                (None, None) => Ok(()),
                _ => invalid("DISCONNECT carries no payload"),
            },
        }
    }
}

fn validate_namespace(ns: &str) -> Result<(), CodecError> {
    let legal = ns.len() > 1
        && ns
            .chars()
            .skip(1)
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '/' | '.'));
    if legal {
        Ok(())
    } else {
        Err(CodecError::InvalidNamespace(ns.to_string()))
    }
}
