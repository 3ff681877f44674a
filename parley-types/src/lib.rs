//! # parley-types
//!
//! Wire format types for the Parley realtime chat transport.
//!
//! This crate provides the foundational types used across all Parley crates:
//! - [`Frame`] - Outer transport envelope (OPEN/CLOSE/PING/PONG/MESSAGE)
//! - [`Packet`] - Protocol packet inside MESSAGE frames
//! - [`ClientEvent`], [`AdminEvent`], [`ServerEvent`] - Closed event sets
//! - [`ConversationId`], [`Sequence`], [`LocalId`] - Identity and ordering types
//! - [`CodecError`], [`RemoteError`] - Error types

#![warn(missing_docs)]
#![warn(clippy::all)]

mod error;
mod events;
mod frame;
mod ids;
mod model;
mod packet;

pub use error::{CodecError, ErrorKind, RemoteError};
pub use events::{
    AckReply, AdminEvent, AdminSendMessage, ClientEvent, ConversationJoined, ConversationRef,
    DeliveryNotice, DeliveryReceipt, Empty, EventSet, JoinReply, NewMessage, PresenceNotice,
    SendMessage, SendReply, ServerEvent, SessionsReply, ShutdownNotice, SyncReply, SyncRequest,
    TypingNotice, TypingUpdate,
};
pub use frame::{Frame, FrameType, OpenHandshake, DEFAULT_MAX_PAYLOAD};
pub use ids::{AgentId, AppId, ConnectionId, ConversationId, DeviceId, LocalId, Sequence, ServerId};
pub use model::{ChatMessage, ConnectAuth, DeliveryStatus, Sender, SessionInfo};
pub use packet::{Namespace, Packet, PacketType, ADMIN_NAMESPACE, DEFAULT_NAMESPACE};
