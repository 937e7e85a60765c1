//! Processed-message audit log
//!
//! Durable table of processed-message keys, the idempotency filter for
//! replay. A command is a duplicate when its id was seen before; an event
//! when its `(source_type, source_id, version)` was. The rebuilder runs
//! the transaction-scoped variants so the keys commit with the rebuild.

use sqlx::{PgPool, Postgres, Transaction};

use crate::serializer::LoggedMessage;

/// Audit log errors
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Identity under which a message is remembered.
pub(crate) fn dedup_key(message: &LoggedMessage) -> String {
    match message {
        LoggedMessage::Command(command) => format!("command:{}", command.id),
        LoggedMessage::Event(event) => format!(
            "event:{}:{}:{}",
            event.source_type, event.source_id, event.version
        ),
    }
}

/// Repository over the `processed_messages` table.
#[derive(Debug, Clone)]
pub struct MessageAuditLog {
    pool: PgPool,
}

impl MessageAuditLog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Whether the message was processed before
    pub async fn is_duplicate(&self, message: &LoggedMessage) -> Result<bool, AuditError> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM processed_messages WHERE dedup_key = $1)",
        )
        .bind(dedup_key(message))
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    /// Remember a processed message
    pub async fn save(&self, message: &LoggedMessage) -> Result<(), AuditError> {
        let correlation_id = correlation_of(message);
        sqlx::query(
            r#"
            INSERT INTO processed_messages (dedup_key, kind, correlation_id)
            VALUES ($1, $2, $3)
            ON CONFLICT (dedup_key) DO NOTHING
            "#,
        )
        .bind(dedup_key(message))
        .bind(message.kind())
        .bind(correlation_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// As `is_duplicate`, inside a caller-owned transaction
    pub async fn is_duplicate_within(
        tx: &mut Transaction<'_, Postgres>,
        message: &LoggedMessage,
    ) -> Result<bool, AuditError> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM processed_messages WHERE dedup_key = $1)",
        )
        .bind(dedup_key(message))
        .fetch_one(&mut **tx)
        .await?;
        Ok(exists)
    }

    /// As `save`, inside a caller-owned transaction
    pub async fn save_within(
        tx: &mut Transaction<'_, Postgres>,
        message: &LoggedMessage,
    ) -> Result<(), AuditError> {
        let correlation_id = correlation_of(message);
        sqlx::query(
            r#"
            INSERT INTO processed_messages (dedup_key, kind, correlation_id)
            VALUES ($1, $2, $3)
            ON CONFLICT (dedup_key) DO NOTHING
            "#,
        )
        .bind(dedup_key(message))
        .bind(message.kind())
        .bind(correlation_id)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}

fn correlation_of(message: &LoggedMessage) -> Option<String> {
    match message {
        LoggedMessage::Command(command) => Some(command.id.to_string()),
        LoggedMessage::Event(event) => event.correlation_id.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{Command, VersionedEvent};
    use uuid::Uuid;

    #[test]
    fn test_command_key_is_its_id() {
        let command = Command::new("add_item", Uuid::new_v4(), serde_json::json!({}));
        let key = dedup_key(&LoggedMessage::Command(command.clone()));
        assert_eq!(key, format!("command:{}", command.id));
    }

    #[test]
    fn test_event_key_is_stream_position() {
        let source = Uuid::new_v4();
        let event = VersionedEvent {
            source_id: source,
            source_type: "FakeItems".to_string(),
            version: 4,
            event_type: "item_added".to_string(),
            payload: serde_json::json!({}),
            correlation_id: None,
            created_at: chrono::Utc::now(),
        };
        let key = dedup_key(&LoggedMessage::Event(event));
        assert_eq!(key, format!("event:FakeItems:{}:4", source));
    }

    #[test]
    fn test_same_event_different_version_is_distinct() {
        let source = Uuid::new_v4();
        let make = |version| {
            LoggedMessage::Event(VersionedEvent {
                source_id: source,
                source_type: "FakeItems".to_string(),
                version,
                event_type: "item_added".to_string(),
                payload: serde_json::json!({}),
                correlation_id: None,
                created_at: chrono::Utc::now(),
            })
        };
        assert_ne!(dedup_key(&make(1)), dedup_key(&make(2)));
    }
}
