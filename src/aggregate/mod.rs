//! Aggregate base
//!
//! Event-sourced aggregate roots. State is derived from events, never
//! directly mutated: applying an event from history advances the version,
//! emitting a new event additionally queues it for persistence. Rehydrators
//! are registered per event tag in a lookup table, so applying is a table
//! lookup rather than a match over a closed enum.

pub mod complex;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::messages::{Command, VersionedEvent};

/// Errors raised while building or mutating aggregates
#[derive(Debug, thiserror::Error)]
pub enum AggregateError {
    /// History contains a version that is not previous + 1
    #[error("Rehydration mismatch: expected version {expected}, found {found}")]
    RehydrationMismatch { expected: i64, found: i64 },

    /// An event tag with no registered rehydrator was applied
    #[error("No rehydrator registered for event type '{event_type}'")]
    MissingRehydrator { event_type: String },

    /// An aggregate was asked to rehydrate from an empty history
    #[error("Cannot rehydrate from an empty history")]
    EmptyHistory,

    /// A memento could not be decoded by the owning aggregate type
    #[error("Snapshot could not be restored")]
    SnapshotRestore,

    /// The parked-event list reached its capacity
    #[error("Parked event list full (capacity {capacity})")]
    ParkedOverflow { capacity: usize },

    /// An event payload did not decode
    #[error("Invalid event payload: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Applies one event payload to the state
pub type Rehydrator<S> = fn(&mut S, &serde_json::Value) -> Result<(), AggregateError>;

/// Per-event-tag rehydrator lookup, built once in the aggregate constructor
#[derive(Debug)]
pub struct RehydratorTable<S> {
    entries: HashMap<&'static str, Rehydrator<S>>,
}

impl<S> RehydratorTable<S> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Register a rehydrator for an event tag
    pub fn on(mut self, event_type: &'static str, rehydrator: Rehydrator<S>) -> Self {
        self.entries.insert(event_type, rehydrator);
        self
    }

    fn get(&self, event_type: &str) -> Option<&Rehydrator<S>> {
        self.entries.get(event_type)
    }
}

impl<S> Default for RehydratorTable<S> {
    fn default() -> Self {
        Self::new()
    }
}

/// Opaque aggregate snapshot: only the owning aggregate type knows how to
/// decode the payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Memento {
    pub version: i64,
    pub payload: serde_json::Value,
}

/// Domain state of an event-sourced aggregate.
///
/// `rehydrators()` declares which event tags the state understands.
/// Snapshot support is opt-in: originators override `snapshotting()`,
/// `memento()` and `restore()`.
pub trait AggregateState: Default + Send + Sync {
    /// Aggregate kind as persisted, e.g. "FakeItems"
    fn source_type() -> &'static str;

    /// Event-tag registrations for this state
    fn rehydrators() -> RehydratorTable<Self>
    where
        Self: Sized;

    /// Whether this aggregate type produces mementos
    fn snapshotting() -> bool {
        false
    }

    /// Encode the current state as an opaque memento payload
    fn memento(&self) -> Option<serde_json::Value> {
        None
    }

    /// Decode a memento payload back into state
    fn restore(_payload: &serde_json::Value) -> Option<Self>
    where
        Self: Sized,
    {
        None
    }
}

/// An event-sourced aggregate root.
///
/// Holds the identity, the last applied version, the pending (not yet
/// persisted) events in emission order, and pending commands when the
/// aggregate acts as a saga.
#[derive(Debug)]
pub struct AggregateRoot<S: AggregateState> {
    id: Uuid,
    version: i64,
    state: S,
    table: RehydratorTable<S>,
    pending_events: Vec<VersionedEvent>,
    pending_commands: Vec<Command>,
}

impl<S: AggregateState> AggregateRoot<S> {
    /// A fresh aggregate with no history
    pub fn new(id: Uuid) -> Self {
        Self {
            id,
            version: 0,
            state: S::default(),
            table: S::rehydrators(),
            pending_events: Vec::new(),
            pending_commands: Vec::new(),
        }
    }

    /// Rehydrate from a full event history, ascending by version.
    ///
    /// Fails with `RehydrationMismatch` on any gap; a gap means the
    /// persisted stream is corrupt.
    pub fn from_history(id: Uuid, history: &[VersionedEvent]) -> Result<Self, AggregateError> {
        if history.is_empty() {
            return Err(AggregateError::EmptyHistory);
        }

        let mut root = Self::new(id);
        for event in history {
            root.apply_history_event(event)?;
        }
        Ok(root)
    }

    /// Rehydrate from a memento plus the event tail persisted after it
    pub fn from_memento(
        id: Uuid,
        memento: &Memento,
        tail: &[VersionedEvent],
    ) -> Result<Self, AggregateError> {
        let state = S::restore(&memento.payload).ok_or(AggregateError::SnapshotRestore)?;

        let mut root = Self::new(id);
        root.state = state;
        root.version = memento.version;
        for event in tail {
            root.apply_history_event(event)?;
        }
        Ok(root)
    }

    /// Apply one historical event: contiguity check, table lookup, version
    /// bump. Does not touch the pending list.
    pub(crate) fn apply_history_event(
        &mut self,
        event: &VersionedEvent,
    ) -> Result<(), AggregateError> {
        if event.version != self.version + 1 {
            return Err(AggregateError::RehydrationMismatch {
                expected: self.version + 1,
                found: event.version,
            });
        }

        let rehydrator =
            self.table
                .get(&event.event_type)
                .ok_or_else(|| AggregateError::MissingRehydrator {
                    event_type: event.event_type.clone(),
                })?;
        rehydrator(&mut self.state, &event.payload)?;

        self.version = event.version;
        Ok(())
    }

    /// Emit a new event: stamp source and version, rehydrate, queue for
    /// persistence.
    pub fn update(
        &mut self,
        event_type: &str,
        payload: serde_json::Value,
    ) -> Result<(), AggregateError> {
        let rehydrator =
            self.table
                .get(event_type)
                .ok_or_else(|| AggregateError::MissingRehydrator {
                    event_type: event_type.to_string(),
                })?;
        rehydrator(&mut self.state, &payload)?;

        self.version += 1;
        self.pending_events.push(VersionedEvent {
            source_id: self.id,
            source_type: S::source_type().to_string(),
            version: self.version,
            event_type: event_type.to_string(),
            payload,
            correlation_id: None,
            created_at: chrono::Utc::now(),
        });
        Ok(())
    }

    /// Saga capability: queue a command for co-publication on save
    pub fn issue(&mut self, command: Command) {
        self.pending_commands.push(command);
    }

    /// Pending events in emission order; clears the list. Event-store use.
    pub fn drain_pending(&mut self) -> Vec<VersionedEvent> {
        std::mem::take(&mut self.pending_events)
    }

    /// Pending saga commands in emission order; clears the list.
    pub fn drain_pending_commands(&mut self) -> Vec<Command> {
        std::mem::take(&mut self.pending_commands)
    }

    pub fn has_pending_events(&self) -> bool {
        !self.pending_events.is_empty()
    }

    pub fn has_pending_commands(&self) -> bool {
        !self.pending_commands.is_empty()
    }

    /// Snapshot of the current state, if the aggregate type supports it
    pub fn memento(&self) -> Option<Memento> {
        self.state.memento().map(|payload| Memento {
            version: self.version,
            payload,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn version(&self) -> i64 {
        self.version
    }

    pub fn state(&self) -> &S {
        &self.state
    }
}

// =========================================================================
// Tests
// =========================================================================
