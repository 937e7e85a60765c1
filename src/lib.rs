//! eventline Library
//!
//! Event-sourced persistence and messaging core: aggregates mutate only by
//! appending versioned events, the event store co-commits outbound
//! messages, and the message log supports a deterministic rebuild.
//! Re-exports modules for integration testing and embedding.

pub mod aggregate;
pub mod audit;
pub mod bus;
pub mod dispatcher;
pub mod event_store;
pub mod message_log;
pub mod messages;
pub mod processor;
pub mod rebuild;
pub mod serializer;
pub mod tracer;
pub mod worker;

// Private modules (used only by the binary)
pub mod config;
pub mod db;
mod error;

pub use config::Config;
pub use error::{CoreError, CoreResult};

pub use aggregate::{AggregateError, AggregateRoot, AggregateState, Memento, RehydratorTable};
pub use bus::{CommandBus, EventBus, InMemoryBus, SqlOutboxBus};
pub use dispatcher::{DispatchMode, EventDispatcher, EventHandler};
pub use event_store::{EventStore, EventStoreError, SnapshotCache, Trigger};
pub use messages::{Command, Envelope, VersionedEvent};
pub use processor::{CommandHandler, CommandProcessor};
pub use serializer::{JsonSerializer, LoggedMessage, Serializer};
pub use worker::{Worker, WorkerState};
