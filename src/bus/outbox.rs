//! SQL outbox bus
//!
//! Appends outbound messages to outbox tables inside the caller's
//! transaction: a committed save makes exactly its messages visible, a
//! rolled-back save leaves none behind. A relay draining the outbox tables
//! to a broker is a deployment concern outside this crate.

use async_trait::async_trait;
use sqlx::{Postgres, Transaction};

use crate::messages::{Command, Envelope, VersionedEvent};

use super::{BusError, CommandBus, EventBus};

/// Event/command bus backed by `outbox_events` / `outbox_commands`.
#[derive(Debug, Clone, Default)]
pub struct SqlOutboxBus;

impl SqlOutboxBus {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl EventBus for SqlOutboxBus {
    fn name(&self) -> &'static str {
        "sql_outbox"
    }

    fn enlists_in_transaction(&self) -> bool {
        true
    }

    async fn publish(
        &self,
        envelopes: &[Envelope<VersionedEvent>],
        tx: &mut Transaction<'_, Postgres>,
    ) -> Result<(), BusError> {
        for envelope in envelopes {
            let payload = serde_json::to_string(&envelope.body)?;
            sqlx::query(
                r#"
                INSERT INTO outbox_events (message_id, correlation_id, payload)
                VALUES ($1, $2, $3)
                "#,
            )
            .bind(&envelope.message_id)
            .bind(&envelope.correlation_id)
            .bind(payload)
            .execute(&mut **tx)
            .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl CommandBus for SqlOutboxBus {
    fn name(&self) -> &'static str {
        "sql_outbox"
    }

    fn enlists_in_transaction(&self) -> bool {
        true
    }

    async fn send(
        &self,
        envelopes: &[Envelope<Command>],
        tx: &mut Transaction<'_, Postgres>,
    ) -> Result<(), BusError> {
        for envelope in envelopes {
            let payload = serde_json::to_string(&envelope.body)?;
            sqlx::query(
                r#"
                INSERT INTO outbox_commands (message_id, correlation_id, payload)
                VALUES ($1, $2, $3)
                "#,
            )
            .bind(&envelope.message_id)
            .bind(&envelope.correlation_id)
            .bind(payload)
            .execute(&mut **tx)
            .await?;
        }
        Ok(())
    }
}
