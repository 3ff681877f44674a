//! SQLite storage backend for parley-relay.

use super::{Conversation, MessageStore, StoreMessageRequest, StoreOutcome};
use crate::error::StorageError;
use async_trait::async_trait;
use parley_types::{
    AppId, ChatMessage, ConversationId, DeviceId, LocalId, Sender, Sequence, ServerId,
};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

/// SQLite-based message storage.
///
/// Uses WAL mode for concurrent reads/writes.
#[derive(Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl std::fmt::Debug for SqliteStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStorage").finish_non_exhaustive()
    }
}

impl SqliteStorage {
    /// Create a new SQLite storage from a database path.
    ///
    /// Creates the database file if it doesn't exist.
    pub async fn new(path: &Path) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await
            .map_err(StorageError::Database)?;

        let storage = Self { pool };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Create an in-memory SQLite storage (for testing).
    pub async fn in_memory() -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str(":memory:")
            .map_err(StorageError::Database)?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(StorageError::Database)?;

        let storage = Self { pool };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Run database migrations.
    async fn run_migrations(&self) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                app_id TEXT NOT NULL,
                device_id TEXT NOT NULL,
                next_sequence INTEGER NOT NULL DEFAULT 1,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                server_id INTEGER PRIMARY KEY AUTOINCREMENT,
                local_id TEXT NOT NULL UNIQUE,
                conversation_id TEXT NOT NULL,
                sequence INTEGER NOT NULL,
                sender TEXT NOT NULL,
                body TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                UNIQUE(conversation_id, sequence)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS deliveries (
                server_id INTEGER NOT NULL,
                device_id TEXT NOT NULL,
                delivered_at INTEGER NOT NULL,
                PRIMARY KEY (server_id, device_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_messages_conversation_sequence ON messages(conversation_id, sequence)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_conversations_device ON conversations(app_id, device_id, updated_at)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    fn current_millis() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }

    async fn message_by_local_id(
        &self,
        local_id: &LocalId,
    ) -> Result<Option<ChatMessage>, StorageError> {
        let row = sqlx::query_as::<_, MessageRow>(
            r#"
            SELECT server_id, local_id, conversation_id, sequence, sender, body, created_at
            FROM messages
            WHERE local_id = ?1
            "#,
        )
        .bind(local_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(TryInto::try_into).transpose()
    }
}

#[async_trait]
impl MessageStore for SqliteStorage {
    async fn create_conversation(
        &self,
        app_id: &AppId,
        device_id: &DeviceId,
    ) -> Result<Conversation, StorageError> {
        let conversation = Conversation {
            id: ConversationId::new(),
            app_id: app_id.clone(),
            device_id: device_id.clone(),
            last_sequence: Sequence::zero(),
            updated_at: Self::current_millis(),
        };

        sqlx::query(
            r#"
            INSERT INTO conversations (id, app_id, device_id, next_sequence, updated_at)
            VALUES (?1, ?2, ?3, 1, ?4)
            "#,
        )
        .bind(conversation.id.to_string())
        .bind(app_id.as_str())
        .bind(device_id.as_str())
        .bind(conversation.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(conversation)
    }

    async fn get_conversation(
        &self,
        id: &ConversationId,
    ) -> Result<Option<Conversation>, StorageError> {
        let row = sqlx::query_as::<_, ConversationRow>(
            r#"
            SELECT id, app_id, device_id, next_sequence, updated_at
            FROM conversations
            WHERE id = ?1
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(TryInto::try_into).transpose()
    }

    async fn latest_conversation(
        &self,
        app_id: &AppId,
        device_id: &DeviceId,
    ) -> Result<Option<Conversation>, StorageError> {
        let row = sqlx::query_as::<_, ConversationRow>(
            r#"
            SELECT id, app_id, device_id, next_sequence, updated_at
            FROM conversations
            WHERE app_id = ?1 AND device_id = ?2
            ORDER BY updated_at DESC, rowid DESC
            LIMIT 1
            "#,
        )
        .bind(app_id.as_str())
        .bind(device_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(TryInto::try_into).transpose()
    }

    async fn store_message(&self, req: StoreMessageRequest) -> Result<StoreOutcome, StorageError> {
        if let Some(message) = self.message_by_local_id(&req.local_id).await? {
            return Ok(StoreOutcome {
                message,
                duplicate: true,
            });
        }

        let now = Self::current_millis();
        let sender = serde_json::to_string(&req.sender)
            .map_err(|e| StorageError::CorruptRow(e.to_string()))?;

        // Bumping the counter first takes the write lock, which serializes
        // concurrent stores for the rest of the transaction.
        let mut tx = self.pool.begin().await?;
        let sequence: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE conversations
            SET next_sequence = next_sequence + 1, updated_at = ?2
            WHERE id = ?1
            RETURNING next_sequence - 1
            "#,
        )
        .bind(req.conversation_id.to_string())
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(sequence) = sequence else {
            return Err(StorageError::ConversationNotFound(req.conversation_id));
        };

        let existing: Option<i64> =
            sqlx::query_scalar("SELECT server_id FROM messages WHERE local_id = ?1")
                .bind(req.local_id.to_string())
                .fetch_optional(&mut *tx)
                .await?;
        if existing.is_some() {
            // Lost a race with the same localId; the rollback returns the sequence.
            tx.rollback().await?;
            let message = self
                .message_by_local_id(&req.local_id)
                .await?
                .ok_or_else(|| StorageError::CorruptRow(req.local_id.to_string()))?;
            return Ok(StoreOutcome {
                message,
                duplicate: true,
            });
        }

        let server_id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO messages (local_id, conversation_id, sequence, sender, body, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            RETURNING server_id
            "#,
        )
        .bind(req.local_id.to_string())
        .bind(req.conversation_id.to_string())
        .bind(sequence)
        .bind(&sender)
        .bind(&req.body)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(StoreOutcome {
            message: ChatMessage {
                server_id: ServerId::new(server_id as u64),
                local_id: req.local_id,
                conversation_id: req.conversation_id,
                sequence: Sequence::new(sequence as u64),
                sender: req.sender,
                body: req.body,
                created_at: now,
            },
            duplicate: false,
        })
    }

    async fn messages_after(
        &self,
        conversation_id: &ConversationId,
        after: Sequence,
        limit: u32,
    ) -> Result<Vec<ChatMessage>, StorageError> {
        let rows = sqlx::query_as::<_, MessageRow>(
            r#"
            SELECT server_id, local_id, conversation_id, sequence, sender, body, created_at
            FROM messages
            WHERE conversation_id = ?1 AND sequence > ?2
            ORDER BY sequence ASC
            LIMIT ?3
            "#,
        )
        .bind(conversation_id.to_string())
        .bind(after.value() as i64)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn mark_delivered(
        &self,
        server_ids: &[ServerId],
        device_id: &DeviceId,
    ) -> Result<u64, StorageError> {
        if server_ids.is_empty() {
            return Ok(0);
        }

        let now = Self::current_millis();
        let mut marked = 0;

        // Use a transaction for batch insert
        let mut tx = self.pool.begin().await?;
        for server_id in server_ids {
            let result = sqlx::query(
                r#"
                INSERT INTO deliveries (server_id, device_id, delivered_at)
                VALUES (?1, ?2, ?3)
                ON CONFLICT(server_id, device_id) DO NOTHING
                "#,
            )
            .bind(server_id.value() as i64)
            .bind(device_id.as_str())
            .bind(now)
            .execute(&mut *tx)
            .await?;
            marked += result.rows_affected();
        }
        tx.commit().await?;

        Ok(marked)
    }

    async fn is_delivered(
        &self,
        server_id: ServerId,
        device_id: &DeviceId,
    ) -> Result<bool, StorageError> {
        let found: Option<i64> = sqlx::query_scalar(
            "SELECT 1 FROM deliveries WHERE server_id = ?1 AND device_id = ?2",
        )
        .bind(server_id.value() as i64)
        .bind(device_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(found.is_some())
    }

    async fn total_messages(&self) -> Result<u64, StorageError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }
}

/// Internal row type for conversation queries.
#[derive(sqlx::FromRow)]
struct ConversationRow {
    id: String,
    app_id: String,
    device_id: String,
    next_sequence: i64,
    updated_at: i64,
}

impl TryFrom<ConversationRow> for Conversation {
    type Error = StorageError;

    fn try_from(row: ConversationRow) -> Result<Self, Self::Error> {
        Ok(Conversation {
            id: ConversationId::parse(&row.id)
                .ok_or_else(|| StorageError::CorruptRow(format!("conversation id {}", row.id)))?,
            app_id: AppId::from(row.app_id),
            device_id: DeviceId::from(row.device_id),
            last_sequence: Sequence::new(row.next_sequence.saturating_sub(1) as u64),
            updated_at: row.updated_at,
        })
    }
}

/// Internal row type for message queries.
#[derive(sqlx::FromRow)]
struct MessageRow {
    server_id: i64,
    local_id: String,
    conversation_id: String,
    sequence: i64,
    sender: String,
    body: String,
    created_at: i64,
}

impl TryFrom<MessageRow> for ChatMessage {
    type Error = StorageError;

    fn try_from(row: MessageRow) -> Result<Self, Self::Error> {
        let sender: Sender = serde_json::from_str(&row.sender)
            .map_err(|e| StorageError::CorruptRow(format!("sender: {e}")))?;
        Ok(ChatMessage {
            server_id: ServerId::new(row.server_id as u64),
            local_id: LocalId::parse(&row.local_id)
                .ok_or_else(|| StorageError::CorruptRow(format!("local id {}", row.local_id)))?,
            conversation_id: ConversationId::parse(&row.conversation_id).ok_or_else(|| {
                StorageError::CorruptRow(format!("conversation id {}", row.conversation_id))
            })?,
            sequence: Sequence::new(row.sequence as u64),
            sender,
            body: row.body,
            created_at: row.created_at,
        })
    }
}
