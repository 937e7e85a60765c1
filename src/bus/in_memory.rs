//! In-memory bus
//!
//! Single-threaded collector used by the rebuilder and by handlers that
//! queue further work within the current processing round. Messages stay
//! in process; the transaction argument is ignored (delivery only happens
//! when the round drains the queues, after the caller decided the fate of
//! its transaction).

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use sqlx::{Postgres, Transaction};

use crate::messages::{Command, Envelope, VersionedEvent};

use super::{BusError, CommandBus, EventBus};

/// FIFO command and event queues behind one mutex each.
#[derive(Debug, Default)]
pub struct InMemoryBus {
    pending_commands: Mutex<VecDeque<Command>>,
    pending_events: Mutex<VecDeque<VersionedEvent>>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_new_commands(&self) -> bool {
        !self
            .pending_commands
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_empty()
    }

    pub fn has_new_events(&self) -> bool {
        !self
            .pending_events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_empty()
    }

    /// Queued commands in FIFO order; clears the queue
    pub fn drain_commands(&self) -> Vec<Command> {
        self.pending_commands
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain(..)
            .collect()
    }

    /// Queued events in FIFO order; clears the queue
    pub fn drain_events(&self) -> Vec<VersionedEvent> {
        self.pending_events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain(..)
            .collect()
    }
}

#[async_trait]
impl EventBus for InMemoryBus {
    fn name(&self) -> &'static str {
        "in_memory"
    }

    fn enlists_in_transaction(&self) -> bool {
        true
    }

    async fn publish(
        &self,
        envelopes: &[Envelope<VersionedEvent>],
        _tx: &mut Transaction<'_, Postgres>,
    ) -> Result<(), BusError> {
        let mut queue = self
            .pending_events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for envelope in envelopes {
            queue.push_back(envelope.body.clone());
        }
        Ok(())
    }
}

#[async_trait]
impl CommandBus for InMemoryBus {
    fn name(&self) -> &'static str {
        "in_memory"
    }

    fn enlists_in_transaction(&self) -> bool {
        true
    }

    async fn send(
        &self,
        envelopes: &[Envelope<Command>],
        _tx: &mut Transaction<'_, Postgres>,
    ) -> Result<(), BusError> {
        let mut queue = self
            .pending_commands
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for envelope in envelopes {
            queue.push_back(envelope.body.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_fifo_within_each_queue() {
        let bus = InMemoryBus::new();

        {
            let mut commands = bus.pending_commands.lock().unwrap();
            commands.push_back(Command::new("first", Uuid::new_v4(), serde_json::json!({})));
            commands.push_back(Command::new("second", Uuid::new_v4(), serde_json::json!({})));
        }

        assert!(bus.has_new_commands());
        let drained = bus.drain_commands();
        assert_eq!(drained[0].command_type, "first");
        assert_eq!(drained[1].command_type, "second");
        assert!(!bus.has_new_commands());
        assert!(bus.drain_commands().is_empty());
    }

    #[test]
    fn test_event_queue_independent_of_commands() {
        let bus = InMemoryBus::new();
        assert!(!bus.has_new_events());

        {
            let mut events = bus.pending_events.lock().unwrap();
            events.push_back(VersionedEvent {
                source_id: Uuid::new_v4(),
                source_type: "FakeItems".to_string(),
                version: 1,
                event_type: "item_added".to_string(),
                payload: serde_json::json!({}),
                correlation_id: None,
                created_at: chrono::Utc::now(),
            });
        }

        assert!(bus.has_new_events());
        assert!(!bus.has_new_commands());
        assert_eq!(bus.drain_events().len(), 1);
        assert!(!bus.has_new_events());
    }
}
