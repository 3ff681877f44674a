//! Chat domain records shared by client and relay.

use serde::{Deserialize, Serialize};

use crate::{AgentId, AppId, ConnectionId, ConversationId, DeviceId, LocalId, Sequence, ServerId};

/// Who authored a message or typing indicator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Sender {
    /// End user on a device.
    User {
        /// Device the message was written on.
        device_id: DeviceId,
    },
    /// Support operator.
    Agent {
        /// Operator identifier.
        agent_id: AgentId,
        /// Display name shown to the end user.
        name: String,
    },
    /// Automated system message.
    System,
}

impl Sender {
    /// Whether this sender is the end user on `device`.
    pub fn is_device(&self, device: &DeviceId) -> bool {
        matches!(self, Sender::User { device_id } if device_id == device)
    }
}

/// A message as stored by the persistence layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    /// Persistence-assigned id.
    pub server_id: ServerId,
    /// Client-generated idempotency key.
    pub local_id: LocalId,
    /// Conversation this message belongs to.
    pub conversation_id: ConversationId,
    /// Gap-free per-conversation ordering key.
    pub sequence: Sequence,
    /// Author.
    pub sender: Sender,
    /// Message text.
    pub body: String,
    /// Unix milliseconds at creation (informational, never used for ordering).
    pub created_at: i64,
}

/// Client-side delivery state of an outgoing message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Waiting in the outbox.
    Queued,
    /// Sent, awaiting the server's reply.
    Sending,
    /// Stored by the server.
    Sent,
    /// Gave up after exhausting retries; needs manual retry.
    Failed,
}

/// Auth payload carried by the CONNECT packet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectAuth {
    /// Tenant.
    pub app_id: AppId,
    /// End-user device (client namespace).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<DeviceId>,
    /// Operator (admin namespace).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<AgentId>,
    /// Credential issued by the auth collaborator.
    pub token: String,
}

/// One live end-user connection, as listed for operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    /// Connection id.
    pub connection_id: ConnectionId,
    /// Device behind the connection.
    pub device_id: DeviceId,
    /// Tenant.
    pub app_id: AppId,
    /// Unix milliseconds when the connection authenticated.
    pub connected_at: i64,
}
