//! Event store errors

use uuid::Uuid;

use crate::aggregate::AggregateError;
use crate::bus::BusError;

/// Errors that can occur in the event store
#[derive(Debug, thiserror::Error)]
pub enum EventStoreError {
    /// Aggregate has no persisted events
    #[error("Aggregate not found: {aggregate_type}/{id}")]
    NotFound { aggregate_type: String, id: Uuid },

    /// Optimistic concurrency conflict
    #[error(
        "Concurrency conflict for aggregate {id}: expected next version {expected}, found {found}"
    )]
    ConcurrencyConflict { id: Uuid, expected: i64, found: i64 },

    /// A bus that cannot enroll writes in the store transaction was supplied
    #[error("Bus '{0}' cannot enroll writes in the store transaction")]
    IncompatibleBus(&'static str),

    /// The pinned store session was already committed or rolled back
    #[error("Store session already completed")]
    SessionClosed,

    /// Rehydration failure while building an aggregate
    #[error(transparent)]
    Aggregate(#[from] AggregateError),

    /// Outbound bus failure inside the save transaction
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EventStoreError {
    /// Check if this error is a concurrency conflict
    pub fn is_concurrency_conflict(&self) -> bool {
        matches!(self, EventStoreError::ConcurrencyConflict { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, EventStoreError::NotFound { .. })
    }

    /// Check if this error is worth retrying (transient I/O)
    pub fn is_retryable(&self) -> bool {
        matches!(self, EventStoreError::Database(_))
    }
}
