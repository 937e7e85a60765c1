//! Event store
//!
//! Transactional persistence for event-sourced aggregates: optimistic
//! concurrency, snapshot-accelerated loads, and outbox-style co-commit of
//! outbound messages.

mod error;
mod repository;
mod snapshot_cache;

pub use error::EventStoreError;
pub use repository::{
    EventStore, SharedTransaction, StoreSession, Trigger, DEFAULT_SNAPSHOT_FRESHNESS,
};
pub use snapshot_cache::SnapshotCache;
