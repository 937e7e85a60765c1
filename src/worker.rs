//! Worker
//!
//! The in-process control surface: status, start, stop and the two rebuild
//! operations, exposed as plain methods (protocol framing belongs to the
//! hosting layer). Processing is round-based: one command runs end-to-end,
//! then the in-memory bus drains, commands before events, until empty.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::bus::InMemoryBus;
use crate::dispatcher::{DispatchError, EventDispatcher};
use crate::message_log::{MessageLog, MessageLogError};
use crate::messages::{Command, VersionedEvent};
use crate::processor::{CommandProcessor, ProcessingError};
use crate::rebuild::{EventStoreRebuilder, RebuildError, RebuildReport};
use crate::serializer::LoggedMessage;

/// Worker errors
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// The worker is stopped; start it before processing
    #[error("Worker is stopped")]
    Stopped,

    /// Rebuilds only run while the worker is stopped
    #[error("Stop the worker before rebuilding")]
    Busy,

    #[error(transparent)]
    Processing(#[from] ProcessingError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Rebuild(#[from] RebuildError),

    #[error(transparent)]
    MessageLog(#[from] MessageLogError),
}

/// Observable worker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Started,
    Stopped,
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerState::Started => write!(f, "started"),
            WorkerState::Stopped => write!(f, "stopped"),
        }
    }
}

const READ_MODEL_BATCH: i64 = 500;

/// Processing worker over a registered topology.
pub struct Worker {
    started: AtomicBool,
    processor: Arc<CommandProcessor>,
    dispatcher: Arc<EventDispatcher>,
    bus: Arc<InMemoryBus>,
    rebuilder: EventStoreRebuilder,
    source: MessageLog,
}

impl Worker {
    pub fn new(
        processor: Arc<CommandProcessor>,
        dispatcher: Arc<EventDispatcher>,
        bus: Arc<InMemoryBus>,
        rebuilder: EventStoreRebuilder,
        source: MessageLog,
    ) -> Self {
        Self {
            started: AtomicBool::new(false),
            processor,
            dispatcher,
            bus,
            rebuilder,
            source,
        }
    }

    pub fn status(&self) -> WorkerState {
        if self.started.load(Ordering::SeqCst) {
            WorkerState::Started
        } else {
            WorkerState::Stopped
        }
    }

    pub fn start(&self) {
        self.started.store(true, Ordering::SeqCst);
        tracing::info!("Worker started");
    }

    pub fn stop(&self) {
        self.started.store(false, Ordering::SeqCst);
        tracing::info!("Worker stopped");
    }

    /// Run one processing round for an external command.
    pub async fn process(&self, command: &Command) -> Result<(), WorkerError> {
        if self.status() != WorkerState::Started {
            return Err(WorkerError::Stopped);
        }
        self.processor.process_message(command).await?;
        self.drain().await
    }

    /// Run one processing round for an external event.
    pub async fn process_event(&self, event: &VersionedEvent) -> Result<(), WorkerError> {
        if self.status() != WorkerState::Started {
            return Err(WorkerError::Stopped);
        }
        self.dispatcher.dispatch(event).await?;
        self.drain().await
    }

    /// Messages produced during handling, commands before events, until
    /// both queues are empty.
    async fn drain(&self) -> Result<(), WorkerError> {
        while self.bus.has_new_commands() || self.bus.has_new_events() {
            for command in self.bus.drain_commands() {
                self.processor.process_message(&command).await?;
            }
            if self.bus.has_new_commands() {
                continue;
            }
            for event in self.bus.drain_events() {
                self.dispatcher.dispatch(&event).await?;
            }
        }
        Ok(())
    }

    /// Replay the message log into a fresh event store.
    pub async fn rebuild_event_store(&self) -> Result<RebuildReport, WorkerError> {
        if self.status() == WorkerState::Started {
            return Err(WorkerError::Busy);
        }
        Ok(self.rebuilder.rebuild().await?)
    }

    /// Replay the logged events through the dispatcher so read models
    /// rebuild themselves; commands are skipped. Returns the event count.
    pub async fn rebuild_read_model(&self) -> Result<u64, WorkerError> {
        if self.status() == WorkerState::Started {
            return Err(WorkerError::Busy);
        }

        let mut dispatched = 0u64;
        let mut last_id = 0;
        loop {
            let page = self.source.read_after(last_id, READ_MODEL_BATCH).await?;
            if page.is_empty() {
                break;
            }
            for entry in page {
                last_id = entry.id;
                if let LoggedMessage::Event(event) = self.source.decode(&entry)? {
                    self.dispatcher.dispatch(&event).await?;
                    dispatched += 1;
                }
            }
        }

        tracing::info!(dispatched, "Read model rebuild finished");
        Ok(dispatched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::DispatchMode;
    use crate::rebuild::EventStoreRebuilder;
    use crate::serializer::JsonSerializer;
    use sqlx::PgPool;
    use uuid::Uuid;

    fn test_worker() -> Worker {
        let pool = PgPool::connect_lazy("postgres://localhost/never_connected").unwrap();
        let source = MessageLog::new(pool.clone(), Arc::new(JsonSerializer));
        let rebuilder = EventStoreRebuilder::new(
            source.clone(),
            pool.clone(),
            pool,
            |_store, _processor, _dispatcher| {},
        );
        Worker::new(
            Arc::new(CommandProcessor::new()),
            Arc::new(EventDispatcher::new(DispatchMode::Serial)),
            Arc::new(InMemoryBus::new()),
            rebuilder,
            source,
        )
    }

    #[tokio::test]
    async fn test_status_follows_start_and_stop() {
        let worker = test_worker();
        assert_eq!(worker.status(), WorkerState::Stopped);

        worker.start();
        assert_eq!(worker.status(), WorkerState::Started);
        assert_eq!(worker.status().to_string(), "started");

        worker.stop();
        assert_eq!(worker.status(), WorkerState::Stopped);
    }

    #[tokio::test]
    async fn test_stopped_worker_refuses_processing() {
        let worker = test_worker();
        let command = Command::new("add_item", Uuid::new_v4(), serde_json::json!({}));

        let err = worker.process(&command).await.unwrap_err();
        assert!(matches!(err, WorkerError::Stopped));
    }

    #[tokio::test]
    async fn test_started_worker_refuses_rebuilds() {
        let worker = test_worker();
        worker.start();

        let err = worker.rebuild_event_store().await.unwrap_err();
        assert!(matches!(err, WorkerError::Busy));

        let err = worker.rebuild_read_model().await.unwrap_err();
        assert!(matches!(err, WorkerError::Busy));
    }

    #[tokio::test]
    async fn test_started_worker_dispatches_unhandled_commands_as_errors() {
        let worker = test_worker();
        worker.start();

        let command = Command::new("unregistered", Uuid::new_v4(), serde_json::json!({}));
        let err = worker.process(&command).await.unwrap_err();
        assert!(matches!(
            err,
            WorkerError::Processing(ProcessingError::NoHandler(_))
        ));
    }
}
