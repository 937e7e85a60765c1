//! Cross-aggregate event consumption
//!
//! A complex aggregate consumes versioned events from foreign streams in
//! addition to sourcing its own. Consumption is idempotent and strictly
//! ordered per foreign stream: duplicates are ignored, early events are
//! parked until their turn comes. Both facts are recorded as bookkeeping
//! events in the aggregate's own stream, so rehydration reproduces the
//! tracking state exactly.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::messages::{Command, VersionedEvent};

use super::{AggregateError, AggregateRoot, AggregateState};

/// Bookkeeping tag: a foreign event reached the domain consumer
pub const FOREIGN_EVENT_PROCESSED: &str = "foreign_event_processed";

/// Bookkeeping tag: a foreign event arrived early and was parked
pub const FOREIGN_EVENT_PARKED: &str = "foreign_event_parked";

/// Upper bound on parked events per aggregate
const PARKED_CAPACITY: usize = 256;

/// Identity of a foreign stream as consumed by this aggregate
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ForeignStreamKey {
    pub source_type: String,
    pub source_id: Uuid,
    pub event_type: String,
}

impl ForeignStreamKey {
    pub fn of(event: &VersionedEvent) -> Self {
        Self {
            source_type: event.source_type.clone(),
            source_id: event.source_id,
            event_type: event.event_type.clone(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ForeignProcessedRecord {
    source_type: String,
    source_id: Uuid,
    event_type: String,
    version: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct ForeignParkedRecord {
    event: VersionedEvent,
}

/// What became of a foreign event offered to the aggregate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForeignEventDisposition {
    /// Reached the domain consumer (possibly draining parked followers)
    Processed,
    /// Already processed or already parked; no side effects
    Duplicate,
    /// Arrived early; parked until its predecessor is processed
    Parked,
}

/// Domain reaction to in-order foreign events.
///
/// The consumer may emit domain events through the root; its state changes
/// come only from those events' rehydrators.
pub trait ForeignEventConsumer: AggregateState {
    fn consume(
        root: &mut AggregateRoot<Self>,
        event: &VersionedEvent,
    ) -> Result<(), AggregateError>
    where
        Self: Sized;
}

/// An aggregate root that additionally consumes foreign versioned events.
pub struct ComplexAggregateRoot<S: ForeignEventConsumer> {
    root: AggregateRoot<S>,
    last_processed: HashMap<ForeignStreamKey, i64>,
    parked: Vec<VersionedEvent>,
}

impl<S: ForeignEventConsumer> ComplexAggregateRoot<S> {
    pub fn new(id: Uuid) -> Self {
        Self {
            root: AggregateRoot::new(id),
            last_processed: HashMap::new(),
            parked: Vec::new(),
        }
    }

    /// Rehydrate from history, replaying bookkeeping tags into the tracking
    /// tables and every other tag through the domain rehydrators.
    pub fn from_history(id: Uuid, history: &[VersionedEvent]) -> Result<Self, AggregateError> {
        if history.is_empty() {
            return Err(AggregateError::EmptyHistory);
        }

        let mut aggregate = Self::new(id);
        for event in history {
            match event.event_type.as_str() {
                FOREIGN_EVENT_PROCESSED | FOREIGN_EVENT_PARKED => {
                    if event.version != aggregate.root.version + 1 {
                        return Err(AggregateError::RehydrationMismatch {
                            expected: aggregate.root.version + 1,
                            found: event.version,
                        });
                    }
                    aggregate.apply_bookkeeping(&event.event_type, &event.payload)?;
                    aggregate.root.version = event.version;
                }
                _ => aggregate.root.apply_history_event(event)?,
            }
        }
        Ok(aggregate)
    }

    /// Offer a foreign event for consumption.
    ///
    /// Dispositions: duplicates are dropped, in-order events reach the
    /// domain consumer (followed by any parked events that became
    /// in-order), early events are parked.
    pub fn try_process_foreign(
        &mut self,
        event: &VersionedEvent,
    ) -> Result<ForeignEventDisposition, AggregateError> {
        let key = ForeignStreamKey::of(event);
        let last = self.last_processed.get(&key).copied().unwrap_or(0);

        if event.version <= last {
            return Ok(ForeignEventDisposition::Duplicate);
        }

        if event.version == last + 1 {
            self.process_in_order(event)?;
            self.drain_parked()?;
            return Ok(ForeignEventDisposition::Processed);
        }

        // Early arrival
        let already_parked = self
            .parked
            .iter()
            .any(|parked| ForeignStreamKey::of(parked) == key && parked.version == event.version);
        if already_parked {
            return Ok(ForeignEventDisposition::Duplicate);
        }
        if self.parked.len() >= PARKED_CAPACITY {
            return Err(AggregateError::ParkedOverflow {
                capacity: PARKED_CAPACITY,
            });
        }

        let record = ForeignParkedRecord {
            event: event.clone(),
        };
        self.emit_bookkeeping(FOREIGN_EVENT_PARKED, serde_json::to_value(record)?)?;
        Ok(ForeignEventDisposition::Parked)
    }

    fn process_in_order(&mut self, event: &VersionedEvent) -> Result<(), AggregateError> {
        S::consume(&mut self.root, event)?;

        let record = ForeignProcessedRecord {
            source_type: event.source_type.clone(),
            source_id: event.source_id,
            event_type: event.event_type.clone(),
            version: event.version,
        };
        self.emit_bookkeeping(FOREIGN_EVENT_PROCESSED, serde_json::to_value(record)?)
    }

    /// Process parked events that have become in-order, repeatedly, until
    /// none apply. Removal from the parked list happens when the matching
    /// `foreign_event_processed` bookkeeping event is applied.
    fn drain_parked(&mut self) -> Result<(), AggregateError> {
        loop {
            let next = self.parked.iter().position(|parked| {
                let key = ForeignStreamKey::of(parked);
                let last = self.last_processed.get(&key).copied().unwrap_or(0);
                parked.version == last + 1
            });

            match next {
                Some(index) => {
                    let event = self.parked[index].clone();
                    self.process_in_order(&event)?;
                }
                None => return Ok(()),
            }
        }
    }

    /// Stamp a bookkeeping event onto this aggregate's own stream and apply
    /// it to the tracking tables.
    fn emit_bookkeeping(
        &mut self,
        event_type: &str,
        payload: serde_json::Value,
    ) -> Result<(), AggregateError> {
        self.apply_bookkeeping(event_type, &payload)?;

        self.root.version += 1;
        self.root.pending_events.push(VersionedEvent {
            source_id: self.root.id,
            source_type: S::source_type().to_string(),
            version: self.root.version,
            event_type: event_type.to_string(),
            payload,
            correlation_id: None,
            created_at: chrono::Utc::now(),
        });
        Ok(())
    }

    fn apply_bookkeeping(
        &mut self,
        event_type: &str,
        payload: &serde_json::Value,
    ) -> Result<(), AggregateError> {
        match event_type {
            FOREIGN_EVENT_PROCESSED => {
                let record: ForeignProcessedRecord = serde_json::from_value(payload.clone())?;
                let key = ForeignStreamKey {
                    source_type: record.source_type,
                    source_id: record.source_id,
                    event_type: record.event_type,
                };
                self.parked.retain(|parked| {
                    !(ForeignStreamKey::of(parked) == key && parked.version == record.version)
                });
                self.last_processed.insert(key, record.version);
            }
            FOREIGN_EVENT_PARKED => {
                let record: ForeignParkedRecord = serde_json::from_value(payload.clone())?;
                self.parked.push(record.event);
            }
            other => {
                return Err(AggregateError::MissingRehydrator {
                    event_type: other.to_string(),
                })
            }
        }
        Ok(())
    }

    // =========================================================================
    // Root delegation
    // =========================================================================

    /// Emit a domain event on this aggregate's own stream
    pub fn update(
        &mut self,
        event_type: &str,
        payload: serde_json::Value,
    ) -> Result<(), AggregateError> {
        self.root.update(event_type, payload)
    }

    pub fn issue(&mut self, command: Command) {
        self.root.issue(command);
    }

    /// The underlying root, for saving through the event store
    pub fn as_root_mut(&mut self) -> &mut AggregateRoot<S> {
        &mut self.root
    }

    pub fn id(&self) -> Uuid {
        self.root.id()
    }

    pub fn version(&self) -> i64 {
        self.root.version()
    }

    pub fn state(&self) -> &S {
        self.root.state()
    }

    pub fn last_processed(&self, key: &ForeignStreamKey) -> i64 {
        self.last_processed.get(key).copied().unwrap_or(0)
    }

    pub fn parked_len(&self) -> usize {
        self.parked.len()
    }
}

// =========================================================================
// Tests
// =========================================================================
