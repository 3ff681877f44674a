//! Error types for parley-relay.

use parley_types::{CodecError, ConversationId, ErrorKind, RemoteError};

/// Main error type for parley-relay operations.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Key-value store error.
    #[error("kv error: {0}")]
    Kv(#[from] KvError),

    /// Protocol error.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Storage layer errors.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Conversation does not exist.
    #[error("conversation not found: {0}")]
    ConversationNotFound(ConversationId),

    /// A stored row could not be decoded.
    #[error("corrupt row: {0}")]
    CorruptRow(String),
}

/// Key-value store errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KvError {
    /// The key holds a different kind of value.
    #[error("wrong type for key {0}")]
    WrongType(String),

    /// The backing store could not be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Protocol layer errors.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Frame or packet could not be decoded.
    #[error("malformed frame: {0}")]
    Codec(#[from] CodecError),

    /// A packet arrived that is not valid in the current session state.
    #[error("unexpected packet: {0}")]
    UnexpectedPacket(String),

    /// No CONNECT within the handshake timeout.
    #[error("handshake timed out")]
    HandshakeTimeout,

    /// Credentials were refused.
    #[error("authentication failed: {0}")]
    Auth(#[from] crate::auth::AuthError),

    /// Connection-level failure.
    #[error("connection error: {0}")]
    Connection(String),
}

impl From<StorageError> for RemoteError {
    fn from(error: StorageError) -> Self {
        match error {
            StorageError::ConversationNotFound(id) => {
                RemoteError::new(ErrorKind::ConversationNotFound, id.to_string())
            }
            other => {
                tracing::error!(error = %other, "storage failure");
                RemoteError::new(ErrorKind::Internal, "storage failure")
            }
        }
    }
}

impl From<KvError> for RemoteError {
    fn from(error: KvError) -> Self {
        tracing::error!(error = %error, "kv failure");
        RemoteError::new(ErrorKind::Internal, "presence store failure")
    }
}

/// Result type alias for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;

/// Result type alias for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Result type alias for protocol operations.
pub type ProtocolResult<T> = std::result::Result<T, ProtocolError>;

/// Result type alias for kv operations.
pub type KvResult<T> = std::result::Result<T, KvError>;
