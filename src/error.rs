//! Error handling module
//!
//! Crate-level error type aggregating the per-module errors, for callers
//! that drive several subsystems through one surface.

use crate::aggregate::AggregateError;
use crate::audit::AuditError;
use crate::bus::BusError;
use crate::config::ConfigError;
use crate::dispatcher::DispatchError;
use crate::event_store::EventStoreError;
use crate::message_log::MessageLogError;
use crate::processor::ProcessingError;
use crate::rebuild::RebuildError;
use crate::serializer::SerializationError;
use crate::worker::WorkerError;

/// Crate-wide Result type
pub type CoreResult<T> = Result<T, CoreError>;

/// Aggregated error type
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error(transparent)]
    Aggregate(#[from] AggregateError),

    #[error(transparent)]
    EventStore(#[from] EventStoreError),

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error(transparent)]
    Processing(#[from] ProcessingError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Audit(#[from] AuditError),

    #[error(transparent)]
    MessageLog(#[from] MessageLogError),

    #[error(transparent)]
    Serialization(#[from] SerializationError),

    #[error(transparent)]
    Rebuild(#[from] RebuildError),

    #[error(transparent)]
    Worker(#[from] WorkerError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}
