//! Message log
//!
//! Durable, ordered log of every externally-originated message. Rows are
//! identified by a monotonically increasing id and carry the serialized
//! payload plus indexable metadata. The rebuilder reads the log lazily in
//! id order; nothing else consumes it.

use std::sync::Arc;

use sqlx::PgPool;

use crate::serializer::{LoggedMessage, SerializationError, Serializer};

/// Message log errors
#[derive(Debug, thiserror::Error)]
pub enum MessageLogError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Serialization(#[from] SerializationError),
}

/// One row of the log
#[derive(Debug, Clone)]
pub struct MessageLogEntry {
    pub id: i64,
    pub kind: String,
    pub payload: String,
}

/// Repository over the `message_log` table.
#[derive(Clone)]
pub struct MessageLog {
    pool: PgPool,
    serializer: Arc<dyn Serializer>,
}

impl MessageLog {
    pub fn new(pool: PgPool, serializer: Arc<dyn Serializer>) -> Self {
        Self { pool, serializer }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn serializer(&self) -> Arc<dyn Serializer> {
        Arc::clone(&self.serializer)
    }

    /// Append one message; returns its log id.
    pub async fn append(&self, message: &LoggedMessage) -> Result<i64, MessageLogError> {
        let payload = self.serializer.serialize(message)?;

        let (source_id, source_type, version, correlation_id) = match message {
            LoggedMessage::Command(command) => {
                (None, None, None, Some(command.id.to_string()))
            }
            LoggedMessage::Event(event) => (
                Some(event.source_id),
                Some(event.source_type.clone()),
                Some(event.version),
                event.correlation_id.clone(),
            ),
        };

        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO message_log (kind, payload, source_id, source_type, version, correlation_id)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id
            "#,
        )
        .bind(message.kind())
        .bind(payload)
        .bind(source_id)
        .bind(source_type)
        .bind(version)
        .bind(correlation_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    /// Total number of logged messages
    pub async fn count(&self) -> Result<i64, MessageLogError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM message_log")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// One page of rows with `id > after_id`, ascending. An empty page
    /// means the log is exhausted.
    pub async fn read_after(
        &self,
        after_id: i64,
        limit: i64,
    ) -> Result<Vec<MessageLogEntry>, MessageLogError> {
        let rows: Vec<(i64, String, String)> = sqlx::query_as(
            r#"
            SELECT id, kind, payload
            FROM message_log
            WHERE id > $1
            ORDER BY id ASC
            LIMIT $2
            "#,
        )
        .bind(after_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(id, kind, payload)| MessageLogEntry { id, kind, payload })
            .collect())
    }

    /// Decode one row back into a message
    pub fn decode(&self, entry: &MessageLogEntry) -> Result<LoggedMessage, MessageLogError> {
        Ok(self.serializer.deserialize(&entry.payload)?)
    }
}
