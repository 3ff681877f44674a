//! Persistence collaborator for parley-relay.
//!
//! Conversations and their messages, with per-conversation gap-free
//! sequences and idempotent upserts keyed by the client's `localId`.

mod sqlite;

pub use sqlite::SqliteStorage;

use crate::error::StorageError;
use async_trait::async_trait;
use parley_types::{
    AppId, ChatMessage, ConversationId, DeviceId, LocalId, Sender, Sequence, ServerId,
};

/// A conversation between one end-user device and the support team.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversation {
    /// Conversation id.
    pub id: ConversationId,
    /// Tenant.
    pub app_id: AppId,
    /// End-user device owning the conversation.
    pub device_id: DeviceId,
    /// Highest sequence stored (0 when empty).
    pub last_sequence: Sequence,
    /// Unix milliseconds of the last stored message (or creation).
    pub updated_at: i64,
}

/// Request to store a new message.
#[derive(Debug, Clone)]
pub struct StoreMessageRequest {
    /// Client idempotency key.
    pub local_id: LocalId,
    /// Target conversation.
    pub conversation_id: ConversationId,
    /// Author.
    pub sender: Sender,
    /// Message text.
    pub body: String,
}

/// Result of an idempotent store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreOutcome {
    /// The stored message (the original one on a duplicate).
    pub message: ChatMessage,
    /// Whether `local_id` had been stored before.
    pub duplicate: bool,
}

/// Trait for message storage backends.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Create an empty conversation for a device.
    async fn create_conversation(
        &self,
        app_id: &AppId,
        device_id: &DeviceId,
    ) -> Result<Conversation, StorageError>;

    /// Look up a conversation.
    async fn get_conversation(
        &self,
        id: &ConversationId,
    ) -> Result<Option<Conversation>, StorageError>;

    /// The device's most recently updated conversation.
    async fn latest_conversation(
        &self,
        app_id: &AppId,
        device_id: &DeviceId,
    ) -> Result<Option<Conversation>, StorageError>;

    /// Store a message, assigning the next sequence of its conversation.
    ///
    /// Idempotent by `local_id`: a repeated request returns the stored
    /// message with `duplicate = true` and consumes no sequence.
    async fn store_message(&self, req: StoreMessageRequest) -> Result<StoreOutcome, StorageError>;

    /// Messages with sequence strictly greater than `after`, ascending.
    async fn messages_after(
        &self,
        conversation_id: &ConversationId,
        after: Sequence,
        limit: u32,
    ) -> Result<Vec<ChatMessage>, StorageError>;

    /// Record that a device received messages. Returns rows newly marked.
    async fn mark_delivered(
        &self,
        server_ids: &[ServerId],
        device_id: &DeviceId,
    ) -> Result<u64, StorageError>;

    /// Whether a device has received a message.
    async fn is_delivered(
        &self,
        server_id: ServerId,
        device_id: &DeviceId,
    ) -> Result<bool, StorageError>;

    /// Total number of stored messages.
    async fn total_messages(&self) -> Result<u64, StorageError>;
}
