//! Event store repository
//!
//! Transactional event persistence with optimistic concurrency control and
//! outbox-style co-commit: the events, the outbound envelopes and any
//! saga-generated commands are written in one database transaction. Loads
//! go through the snapshot cache when the aggregate type supports it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::aggregate::{AggregateRoot, AggregateState, Memento};
use crate::bus::{CommandBus, EventBus};
use crate::messages::{Command, Envelope, VersionedEvent};

use super::snapshot_cache::SnapshotCache;
use super::EventStoreError;

/// Default snapshot freshness window
pub const DEFAULT_SNAPSHOT_FRESHNESS: Duration = Duration::from_secs(1);

/// A transaction owned by an outer operation (the rebuilder) that several
/// store calls execute in. Committing or rolling back takes the
/// transaction out; later calls fail with `SessionClosed`.
pub type SharedTransaction = Arc<tokio::sync::Mutex<Option<Transaction<'static, Postgres>>>>;

/// Where store statements execute: a pool (one transaction per save) or a
/// pinned transaction whose fate the caller decides.
#[derive(Clone, Debug)]
pub enum StoreSession {
    Pooled(PgPool),
    Pinned(SharedTransaction),
}

/// The message whose handling caused a save; correlation derives from it.
pub enum Trigger<'a> {
    Command(&'a Command),
    Event(&'a VersionedEvent),
}

impl Trigger<'_> {
    /// A command correlates by its own id, an event passes its correlation
    /// through.
    pub fn correlation_id(&self) -> Option<String> {
        match self {
            Trigger::Command(command) => Some(command.id.to_string()),
            Trigger::Event(event) => event.correlation_id.clone(),
        }
    }
}

/// Event store over PostgreSQL.
#[derive(Clone)]
pub struct EventStore {
    session: StoreSession,
    event_bus: Arc<dyn EventBus>,
    command_bus: Arc<dyn CommandBus>,
    snapshots: Arc<SnapshotCache>,
    freshness: Duration,
}

impl std::fmt::Debug for EventStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStore")
            .field("session", &self.session)
            .field("snapshots", &self.snapshots)
            .field("freshness", &self.freshness)
            .finish()
    }
}

impl EventStore {
    /// Create a store over a pool. Rejects buses that cannot enroll their
    /// writes in the save transaction.
    pub fn new(
        pool: PgPool,
        event_bus: Arc<dyn EventBus>,
        command_bus: Arc<dyn CommandBus>,
    ) -> Result<Self, EventStoreError> {
        Self::with_session(StoreSession::Pooled(pool), event_bus, command_bus)
    }

    /// Create a store executing in a caller-owned transaction (rebuild).
    pub fn pinned(
        tx: SharedTransaction,
        event_bus: Arc<dyn EventBus>,
        command_bus: Arc<dyn CommandBus>,
    ) -> Result<Self, EventStoreError> {
        Self::with_session(StoreSession::Pinned(tx), event_bus, command_bus)
    }

    fn with_session(
        session: StoreSession,
        event_bus: Arc<dyn EventBus>,
        command_bus: Arc<dyn CommandBus>,
    ) -> Result<Self, EventStoreError> {
        if !event_bus.enlists_in_transaction() {
            return Err(EventStoreError::IncompatibleBus(event_bus.name()));
        }
        if !command_bus.enlists_in_transaction() {
            return Err(EventStoreError::IncompatibleBus(command_bus.name()));
        }

        Ok(Self {
            session,
            event_bus,
            command_bus,
            snapshots: Arc::new(SnapshotCache::new()),
            freshness: DEFAULT_SNAPSHOT_FRESHNESS,
        })
    }

    /// Override the snapshot freshness window
    pub fn with_freshness(mut self, freshness: Duration) -> Self {
        self.freshness = freshness;
        self
    }

    pub fn snapshot_cache(&self) -> Arc<SnapshotCache> {
        Arc::clone(&self.snapshots)
    }

    // =========================================================================
    // Find / Get
    // =========================================================================

    /// Load an aggregate, or `None` when it has no persisted events.
    ///
    /// Snapshot path: a fresh cache entry short-circuits the event read
    /// entirely; a stale or table-loaded snapshot still requires the tail.
    pub async fn find<S: AggregateState>(
        &self,
        id: Uuid,
    ) -> Result<Option<AggregateRoot<S>>, EventStoreError> {
        if S::snapshotting() {
            if let Some(root) = self.find_via_snapshot::<S>(id).await? {
                return Ok(Some(root));
            }
        }

        let history = self.fetch_history(id, S::source_type(), 0).await?;
        if history.is_empty() {
            return Ok(None);
        }
        Ok(Some(AggregateRoot::from_history(id, &history)?))
    }

    /// As `find`, but the aggregate must exist.
    pub async fn get<S: AggregateState>(
        &self,
        id: Uuid,
    ) -> Result<AggregateRoot<S>, EventStoreError> {
        self.find(id).await?.ok_or_else(|| EventStoreError::NotFound {
            aggregate_type: S::source_type().to_string(),
            id,
        })
    }

    async fn find_via_snapshot<S: AggregateState>(
        &self,
        id: Uuid,
    ) -> Result<Option<AggregateRoot<S>>, EventStoreError> {
        let cached = self.snapshots.get(S::source_type(), id, self.freshness);

        let (memento, fresh) = match cached {
            Some(entry) => entry,
            None => match self.fetch_snapshot_row(id, S::source_type()).await? {
                Some(memento) => {
                    // usable for tail reads, but only a save refreshes it
                    self.snapshots
                        .set(S::source_type(), id, memento.clone(), None);
                    (memento, false)
                }
                None => return Ok(None),
            },
        };

        if fresh {
            match AggregateRoot::from_memento(id, &memento, &[]) {
                Ok(root) => return Ok(Some(root)),
                Err(err) => {
                    tracing::warn!(
                        aggregate_type = S::source_type(),
                        %id,
                        error = %err,
                        "Snapshot restore failed, falling back to history"
                    );
                    return Ok(None);
                }
            }
        }

        let tail = self
            .fetch_history(id, S::source_type(), memento.version)
            .await?;
        match AggregateRoot::from_memento(id, &memento, &tail) {
            Ok(root) => Ok(Some(root)),
            Err(err) => {
                tracing::warn!(
                    aggregate_type = S::source_type(),
                    %id,
                    error = %err,
                    "Snapshot restore failed, falling back to history"
                );
                Ok(None)
            }
        }
    }

    // =========================================================================
    // Save
    // =========================================================================

    /// Persist the aggregate's pending events atomically, publishing them
    /// (and any saga commands) on the buses within the same transaction.
    ///
    /// On failure the transaction unwinds and the snapshot cache entry is
    /// marked stale so the next load reads the event tail.
    pub async fn save<S: AggregateState>(
        &self,
        aggregate: &mut AggregateRoot<S>,
        trigger: &Trigger<'_>,
    ) -> Result<(), EventStoreError> {
        let id = aggregate.id();
        let mut events = aggregate.drain_pending();
        if events.is_empty() {
            tracing::trace!(
                aggregate_type = S::source_type(),
                %id,
                "Save with no pending events"
            );
            return Ok(());
        }

        let correlation_id = trigger.correlation_id();
        let now = Utc::now();
        for event in &mut events {
            event.correlation_id = correlation_id.clone();
            event.created_at = now;
        }
        let commands = aggregate.drain_pending_commands();

        let result = match &self.session {
            StoreSession::Pooled(pool) => {
                let mut tx = pool.begin().await?;
                match self
                    .write_within(&mut tx, id, S::source_type(), &events, &commands)
                    .await
                {
                    Ok(()) => tx.commit().await.map_err(EventStoreError::from),
                    Err(err) => {
                        tx.rollback().await.ok();
                        Err(err)
                    }
                }
            }
            StoreSession::Pinned(shared) => {
                let mut guard = shared.lock().await;
                let tx = guard.as_mut().ok_or(EventStoreError::SessionClosed)?;
                self.write_within(tx, id, S::source_type(), &events, &commands)
                    .await
            }
        };

        match result {
            Ok(()) => {
                tracing::debug!(
                    aggregate_type = S::source_type(),
                    %id,
                    events = events.len(),
                    commands = commands.len(),
                    version = aggregate.version(),
                    "Aggregate saved"
                );
                if S::snapshotting() {
                    self.refresh_snapshot(aggregate).await;
                }
                Ok(())
            }
            Err(err) => {
                self.snapshots.mark_stale(S::source_type(), id);
                Err(err)
            }
        }
    }

    /// The transactional body of a save: version check, event rows, bus
    /// hand-off.
    async fn write_within(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        id: Uuid,
        aggregate_type: &str,
        events: &[VersionedEvent],
        commands: &[Command],
    ) -> Result<(), EventStoreError> {
        let last: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT MAX(version) FROM events
            WHERE aggregate_id = $1 AND aggregate_type = $2
            "#,
        )
        .bind(id)
        .bind(aggregate_type)
        .fetch_optional(&mut **tx)
        .await?
        .flatten();

        let expected = last.unwrap_or(0) + 1;
        let first = &events[0];
        if first.version != expected {
            return Err(EventStoreError::ConcurrencyConflict {
                id,
                expected,
                found: first.version,
            });
        }

        for event in events {
            let payload = serde_json::to_string(&event.payload)?;
            sqlx::query(
                r#"
                INSERT INTO events (
                    aggregate_id, aggregate_type, version,
                    payload, event_type, correlation_id, created_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(id)
            .bind(aggregate_type)
            .bind(event.version)
            .bind(payload)
            .bind(&event.event_type)
            .bind(&event.correlation_id)
            .bind(event.created_at)
            .execute(&mut **tx)
            .await
            .map_err(|err| map_version_collision(err, id, event.version))?;
        }

        let envelopes: Vec<Envelope<VersionedEvent>> = events
            .iter()
            .cloned()
            .map(Envelope::for_event)
            .collect();
        self.event_bus.publish(&envelopes, tx).await?;

        if !commands.is_empty() {
            let envelopes: Vec<Envelope<Command>> = commands
                .iter()
                .cloned()
                .map(Envelope::for_command)
                .collect();
            self.command_bus.send(&envelopes, tx).await?;
        }

        Ok(())
    }

    /// Cache and persist the new memento after a successful commit.
    async fn refresh_snapshot<S: AggregateState>(&self, aggregate: &AggregateRoot<S>) {
        // During a rebuild the snapshots table belongs to the pinned
        // transaction; snapshots are rebuilt lazily afterwards.
        let StoreSession::Pooled(pool) = &self.session else {
            return;
        };
        let Some(memento) = aggregate.memento() else {
            return;
        };

        self.snapshots.set(
            S::source_type(),
            aggregate.id(),
            memento.clone(),
            Some(Instant::now()),
        );

        let payload = memento.payload.to_string();
        let result = sqlx::query(
            r#"
            INSERT INTO event_snapshots (aggregate_id, aggregate_type, payload, version)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (aggregate_id, aggregate_type)
            DO UPDATE SET payload = $3, version = $4, created_at = NOW()
            "#,
        )
        .bind(aggregate.id())
        .bind(S::source_type())
        .bind(payload)
        .bind(memento.version)
        .execute(pool)
        .await;

        if let Err(err) = result {
            // the snapshot is an accelerator; the committed events are safe
            tracing::warn!(
                aggregate_type = S::source_type(),
                id = %aggregate.id(),
                error = %err,
                "Snapshot refresh failed"
            );
            self.snapshots.mark_stale(S::source_type(), aggregate.id());
        }
    }

    // =========================================================================
    // Rebuild support
    // =========================================================================

    /// Empty the events and snapshots tables within the current session.
    pub(crate) async fn reset_storage(&self) -> Result<(), EventStoreError> {
        const SQL: &str = "TRUNCATE TABLE events, event_snapshots";
        match &self.session {
            StoreSession::Pooled(pool) => {
                sqlx::query(SQL).execute(pool).await?;
            }
            StoreSession::Pinned(shared) => {
                let mut guard = shared.lock().await;
                let tx = guard.as_mut().ok_or(EventStoreError::SessionClosed)?;
                sqlx::query(SQL).execute(&mut **tx).await?;
            }
        }
        Ok(())
    }

    // =========================================================================
    // Row access
    // =========================================================================

    /// Events for `(id, aggregate_type)` with `version > after`, ascending.
    async fn fetch_history(
        &self,
        id: Uuid,
        aggregate_type: &str,
        after: i64,
    ) -> Result<Vec<VersionedEvent>, EventStoreError> {
        const SQL: &str = r#"
            SELECT version, payload, event_type, correlation_id, created_at
            FROM events
            WHERE aggregate_id = $1 AND aggregate_type = $2 AND version > $3
            ORDER BY version ASC
        "#;

        type Row = (i64, String, String, Option<String>, DateTime<Utc>);
        let rows: Vec<Row> = match &self.session {
            StoreSession::Pooled(pool) => {
                sqlx::query_as(SQL)
                    .bind(id)
                    .bind(aggregate_type)
                    .bind(after)
                    .fetch_all(pool)
                    .await?
            }
            StoreSession::Pinned(shared) => {
                let mut guard = shared.lock().await;
                let tx = guard.as_mut().ok_or(EventStoreError::SessionClosed)?;
                sqlx::query_as(SQL)
                    .bind(id)
                    .bind(aggregate_type)
                    .bind(after)
                    .fetch_all(&mut **tx)
                    .await?
            }
        };

        let mut events = Vec::with_capacity(rows.len());
        for (version, payload, event_type, correlation_id, created_at) in rows {
            events.push(VersionedEvent {
                source_id: id,
                source_type: aggregate_type.to_string(),
                version,
                event_type,
                payload: serde_json::from_str(&payload)?,
                correlation_id,
                created_at,
            });
        }
        Ok(events)
    }

    async fn fetch_snapshot_row(
        &self,
        id: Uuid,
        aggregate_type: &str,
    ) -> Result<Option<Memento>, EventStoreError> {
        const SQL: &str = r#"
            SELECT version, payload
            FROM event_snapshots
            WHERE aggregate_id = $1 AND aggregate_type = $2
        "#;

        let row: Option<(i64, String)> = match &self.session {
            StoreSession::Pooled(pool) => {
                sqlx::query_as(SQL)
                    .bind(id)
                    .bind(aggregate_type)
                    .fetch_optional(pool)
                    .await?
            }
            StoreSession::Pinned(shared) => {
                let mut guard = shared.lock().await;
                let tx = guard.as_mut().ok_or(EventStoreError::SessionClosed)?;
                sqlx::query_as(SQL)
                    .bind(id)
                    .bind(aggregate_type)
                    .fetch_optional(&mut **tx)
                    .await?
            }
        };

        match row {
            Some((version, payload)) => Ok(Some(Memento {
                version,
                payload: serde_json::from_str(&payload)?,
            })),
            None => Ok(None),
        }
    }
}

/// A duplicate `(aggregate_id, aggregate_type, version)` key means a
/// concurrent writer got there first.
fn map_version_collision(err: sqlx::Error, id: Uuid, version: i64) -> EventStoreError {
    if let sqlx::Error::Database(db) = &err {
        if db.code().as_deref() == Some("23505") {
            return EventStoreError::ConcurrencyConflict {
                id,
                expected: version,
                found: version,
            };
        }
    }
    err.into()
}
