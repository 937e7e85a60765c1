//! Message buses
//!
//! Outbound command and event buses. The event store publishes within its
//! own transaction, so a bus must be able to enroll its writes in the
//! caller's transaction; the capability is declared explicitly and checked
//! at store construction.

mod in_memory;
mod outbox;

pub use in_memory::InMemoryBus;
pub use outbox::SqlOutboxBus;

use async_trait::async_trait;
use sqlx::{Postgres, Transaction};

use crate::messages::{Command, Envelope, VersionedEvent};

/// Bus errors
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Outbound event bus.
///
/// `publish` receives the transaction the caller's state change runs in;
/// a SQL-backed bus appends to its outbox inside it, an in-process bus may
/// ignore it.
#[async_trait]
pub trait EventBus: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether published envelopes commit and roll back with the caller's
    /// transaction.
    fn enlists_in_transaction(&self) -> bool;

    async fn publish(
        &self,
        envelopes: &[Envelope<VersionedEvent>],
        tx: &mut Transaction<'_, Postgres>,
    ) -> Result<(), BusError>;
}

/// Outbound command bus, used for saga-generated commands.
#[async_trait]
pub trait CommandBus: Send + Sync {
    fn name(&self) -> &'static str;

    fn enlists_in_transaction(&self) -> bool;

    async fn send(
        &self,
        envelopes: &[Envelope<Command>],
        tx: &mut Transaction<'_, Postgres>,
    ) -> Result<(), BusError>;
}
