//! Event-store rebuilder
//!
//! Reconstructs the event store from the durable message log: every
//! original command and event replays through the same handlers, with the
//! processed-message audit suppressing double application. The destination
//! store and the new audit log each run in one caller-owned transaction;
//! both commit only when the whole log replayed. Given the same log the
//! result is deterministic.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::PgPool;

use crate::audit::{AuditError, MessageAuditLog};
use crate::bus::{CommandBus, EventBus, InMemoryBus};
use crate::dispatcher::{DispatchError, DispatchMode, EventDispatcher, EventHandler};
use crate::event_store::{EventStore, EventStoreError, SharedTransaction};
use crate::message_log::{MessageLog, MessageLogError};
use crate::messages::{Command, Envelope, VersionedEvent};
use crate::processor::{CommandHandler, CommandProcessor, ProcessingError};
use crate::serializer::{LoggedMessage, SerializationError};

const DEFAULT_BATCH_SIZE: i64 = 500;
const PROGRESS_EVERY: u64 = 100;

/// Rebuild errors
#[derive(Debug, thiserror::Error)]
pub enum RebuildError {
    #[error(transparent)]
    Processing(#[from] ProcessingError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    EventStore(#[from] EventStoreError),

    #[error(transparent)]
    MessageLog(#[from] MessageLogError),

    #[error(transparent)]
    Audit(#[from] AuditError),

    #[error(transparent)]
    Serialization(#[from] SerializationError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Progress counters, observable while a rebuild runs.
#[derive(Debug)]
pub struct RebuildCounters {
    total: u64,
    processed: AtomicU64,
    skipped: AtomicU64,
    commands: AtomicU64,
    events: AtomicU64,
}

impl RebuildCounters {
    fn new(total: u64) -> Self {
        Self {
            total,
            processed: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            commands: AtomicU64::new(0),
            events: AtomicU64::new(0),
        }
    }

    fn record_processed(&self) {
        let processed = self.processed.fetch_add(1, Ordering::Relaxed) + 1;
        if processed % PROGRESS_EVERY == 0 {
            tracing::info!(
                processed,
                total = self.total,
                skipped = self.skipped.load(Ordering::Relaxed),
                "Rebuild progress"
            );
        }
    }

    fn record_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    fn record_command(&self) {
        self.commands.fetch_add(1, Ordering::Relaxed);
    }

    fn record_event(&self) {
        self.events.fetch_add(1, Ordering::Relaxed);
    }

    fn report(&self) -> RebuildReport {
        RebuildReport {
            total: self.total,
            processed: self.processed.load(Ordering::Relaxed),
            duplicates_skipped: self.skipped.load(Ordering::Relaxed),
            commands: self.commands.load(Ordering::Relaxed),
            events: self.events.load(Ordering::Relaxed),
        }
    }
}

/// Outcome of a completed rebuild
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebuildReport {
    pub total: u64,
    pub processed: u64,
    pub duplicates_skipped: u64,
    pub commands: u64,
    pub events: u64,
}

/// Wires domain handlers onto the replay topology. Receives the store
/// bound to the rebuild transaction, so handler saves land inside it.
pub type HandlerRegistrar =
    dyn Fn(Arc<EventStore>, &mut CommandProcessor, &mut EventDispatcher) + Send + Sync;

/// Rebuilds a destination event store from a source message log.
pub struct EventStoreRebuilder {
    source: MessageLog,
    store_pool: PgPool,
    audit_pool: PgPool,
    registrar: Box<HandlerRegistrar>,
    batch_size: i64,
}

impl EventStoreRebuilder {
    pub fn new<F>(source: MessageLog, store_pool: PgPool, audit_pool: PgPool, registrar: F) -> Self
    where
        F: Fn(Arc<EventStore>, &mut CommandProcessor, &mut EventDispatcher)
            + Send
            + Sync
            + 'static,
    {
        Self {
            source,
            store_pool,
            audit_pool,
            registrar: Box::new(registrar),
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: i64) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Run the rebuild to completion.
    pub async fn rebuild(&self) -> Result<RebuildReport, RebuildError> {
        let total = self.source.count().await? as u64;
        let counters = RebuildCounters::new(total);
        tracing::info!(total, "Event store rebuild starting");

        let store_tx: SharedTransaction =
            Arc::new(tokio::sync::Mutex::new(Some(self.store_pool.begin().await?)));
        let audit_tx: SharedTransaction =
            Arc::new(tokio::sync::Mutex::new(Some(self.audit_pool.begin().await?)));

        match self.replay(&store_tx, &audit_tx, &counters).await {
            Ok(()) => {
                // audit commits before the event store; ordering preserved
                // from the original design, known crash-consistency hazard
                commit(&audit_tx).await?;
                commit(&store_tx).await?;

                let report = counters.report();
                tracing::info!(
                    processed = report.processed,
                    skipped = report.duplicates_skipped,
                    "Event store rebuild finished"
                );
                Ok(report)
            }
            Err(err) => {
                abandon(&audit_tx).await;
                abandon(&store_tx).await;
                Err(err)
            }
        }
    }

    /// Replay every source message through a topology pinned to the
    /// rebuild transactions.
    async fn replay(
        &self,
        store_tx: &SharedTransaction,
        audit_tx: &SharedTransaction,
        counters: &RebuildCounters,
    ) -> Result<(), RebuildError> {
        let bus = Arc::new(InMemoryBus::new());
        let store = Arc::new(EventStore::pinned(
            Arc::clone(store_tx),
            Arc::clone(&bus) as Arc<dyn EventBus>,
            Arc::clone(&bus) as Arc<dyn CommandBus>,
        )?);
        store.reset_storage().await?;

        // the audit table restarts empty; the replay repopulates it and
        // the truncation commits (or rolls back) with the new keys
        {
            let mut guard = audit_tx.lock().await;
            let tx = guard.as_mut().ok_or(EventStoreError::SessionClosed)?;
            sqlx::query("TRUNCATE TABLE processed_messages RESTART IDENTITY")
                .execute(&mut **tx)
                .await?;
        }

        let mut processor = CommandProcessor::new();
        let mut dispatcher = EventDispatcher::new(DispatchMode::Serial);
        (self.registrar)(Arc::clone(&store), &mut processor, &mut dispatcher);

        let mirror = Arc::new(AuditMirror {
            tx: Arc::clone(audit_tx),
        });
        processor.register_every_command(Arc::clone(&mirror) as Arc<dyn CommandHandler>)?;
        dispatcher.register_catch_all(mirror as Arc<dyn EventHandler>);

        let mut last_id = 0;
        loop {
            let page = self.source.read_after(last_id, self.batch_size).await?;
            if page.is_empty() {
                break;
            }
            for entry in page {
                last_id = entry.id;
                let message = self.source.decode(&entry)?;
                self.deliver(&message, &processor, &dispatcher, audit_tx, counters)
                    .await?;
                self.drain(&bus, &processor, &dispatcher, audit_tx, counters)
                    .await?;
            }
        }
        Ok(())
    }

    /// One message through duplicate suppression and the matching path.
    async fn deliver(
        &self,
        message: &LoggedMessage,
        processor: &CommandProcessor,
        dispatcher: &EventDispatcher,
        audit_tx: &SharedTransaction,
        counters: &RebuildCounters,
    ) -> Result<(), RebuildError> {
        let duplicate = {
            let mut guard = audit_tx.lock().await;
            let tx = guard.as_mut().ok_or(EventStoreError::SessionClosed)?;
            MessageAuditLog::is_duplicate_within(tx, message).await?
        };
        if duplicate {
            counters.record_skipped();
            return Ok(());
        }

        match message {
            LoggedMessage::Command(command) => {
                processor.process_message(command).await?;
                counters.record_command();
            }
            LoggedMessage::Event(event) => {
                dispatcher.dispatch(event).await?;
                counters.record_event();
            }
        }
        counters.record_processed();
        Ok(())
    }

    /// Drain messages produced while handling, commands before events,
    /// until both queues are empty.
    async fn drain(
        &self,
        bus: &InMemoryBus,
        processor: &CommandProcessor,
        dispatcher: &EventDispatcher,
        audit_tx: &SharedTransaction,
        counters: &RebuildCounters,
    ) -> Result<(), RebuildError> {
        while bus.has_new_commands() || bus.has_new_events() {
            for command in bus.drain_commands() {
                self.deliver(
                    &LoggedMessage::Command(command),
                    processor,
                    dispatcher,
                    audit_tx,
                    counters,
                )
                .await?;
            }
            if bus.has_new_commands() {
                continue;
            }
            for event in bus.drain_events() {
                self.deliver(
                    &LoggedMessage::Event(event),
                    processor,
                    dispatcher,
                    audit_tx,
                    counters,
                )
                .await?;
            }
        }
        Ok(())
    }
}

async fn commit(tx: &SharedTransaction) -> Result<(), RebuildError> {
    let taken = tx.lock().await.take();
    match taken {
        Some(tx) => Ok(tx.commit().await?),
        None => Err(EventStoreError::SessionClosed.into()),
    }
}

async fn abandon(tx: &SharedTransaction) {
    if let Some(tx) = tx.lock().await.take() {
        tx.rollback().await.ok();
    }
}

/// Log-writer registered on both the processor and the dispatcher: every
/// processed message lands in the new audit log, inside its transaction.
struct AuditMirror {
    tx: SharedTransaction,
}

#[async_trait]
impl CommandHandler for AuditMirror {
    fn name(&self) -> &'static str {
        "audit_mirror"
    }

    async fn handle(&self, envelope: &Envelope<Command>) -> Result<(), ProcessingError> {
        let message = LoggedMessage::Command(envelope.body.clone());
        let mut guard = self.tx.lock().await;
        let tx = guard
            .as_mut()
            .ok_or(ProcessingError::EventStore(EventStoreError::SessionClosed))?;
        MessageAuditLog::save_within(tx, &message)
            .await
            .map_err(|err| match err {
                AuditError::Database(db) => ProcessingError::Database(db),
            })
    }
}

#[async_trait]
impl EventHandler for AuditMirror {
    fn name(&self) -> &'static str {
        "audit_mirror"
    }

    async fn handle(&self, envelope: &Envelope<VersionedEvent>) -> Result<(), DispatchError> {
        let message = LoggedMessage::Event(envelope.body.clone());
        let mut guard = self.tx.lock().await;
        let tx = guard
            .as_mut()
            .ok_or(DispatchError::EventStore(EventStoreError::SessionClosed))?;
        MessageAuditLog::save_within(tx, &message)
            .await
            .map_err(|err| match err {
                AuditError::Database(db) => DispatchError::Database(db),
            })
    }
}
