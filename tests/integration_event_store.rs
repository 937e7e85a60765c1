//! Integration tests for the event store
//!
//! Require DATABASE_URL to point at a migrated PostgreSQL database; each
//! test skips itself when it is not set.

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use eventline::aggregate::AggregateRoot;
use eventline::bus::{CommandBus, EventBus, InMemoryBus, SqlOutboxBus};
use eventline::event_store::{EventStore, Trigger};
use eventline::messages::Command;

mod common;
use common::{added, clear_aggregate, removed, try_setup_db, FakeItems};

fn store_with_bus(pool: sqlx::PgPool) -> (EventStore, Arc<InMemoryBus>) {
    let bus = Arc::new(InMemoryBus::new());
    let store = EventStore::new(
        pool,
        Arc::clone(&bus) as Arc<dyn EventBus>,
        Arc::clone(&bus) as Arc<dyn CommandBus>,
    )
    .expect("in-memory bus enlists");
    (store, bus)
}

#[tokio::test]
async fn test_single_event_save_and_load() {
    let Some(pool) = try_setup_db().await else { return };
    let id: Uuid = "11111111-1111-1111-1111-111111111111".parse().unwrap();
    clear_aggregate(&pool, id).await;
    let (store, bus) = store_with_bus(pool.clone());

    let mut root = AggregateRoot::<FakeItems>::new(id);
    root.update("item_added", added(1, "x", 10)).unwrap();

    let command = Command::new("add_item", id, added(1, "x", 10));
    store
        .save(&mut root, &Trigger::Command(&command))
        .await
        .unwrap();

    let rows: Vec<(String, i64, String, Option<String>)> = sqlx::query_as(
        r#"
        SELECT aggregate_type, version, event_type, correlation_id
        FROM events WHERE aggregate_id = $1 ORDER BY version
        "#,
    )
    .bind(id)
    .fetch_all(&pool)
    .await
    .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].0, "FakeItems");
    assert_eq!(rows[0].1, 1);
    assert_eq!(rows[0].2, "item_added");
    assert_eq!(rows[0].3, Some(command.id.to_string()));

    let published = bus.drain_events();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].correlation_id, Some(command.id.to_string()));

    let found = store.find::<FakeItems>(id).await.unwrap().unwrap();
    assert_eq!(found.state().quantities[&1], 10);
    assert_eq!(found.version(), 1);
}

#[tokio::test]
async fn test_batch_save_replay_then_remove() {
    let Some(pool) = try_setup_db().await else { return };
    let id = Uuid::new_v4();
    let (store, _bus) = store_with_bus(pool.clone());

    let mut root = AggregateRoot::<FakeItems>::new(id);
    root.update("item_added", added(1, "x", 10)).unwrap();
    root.update("item_added", added(2, "y", 10)).unwrap();
    root.update("item_added", added(1, "x", 5)).unwrap();

    let command = Command::new("add_item", id, serde_json::json!({}));
    store
        .save(&mut root, &Trigger::Command(&command))
        .await
        .unwrap();

    let found = store.find::<FakeItems>(id).await.unwrap().unwrap();
    assert_eq!(found.state().quantities[&1], 15);
    assert_eq!(found.state().quantities[&2], 10);
    assert_eq!(found.version(), 3);

    // remove, re-save, replay
    let mut found = found;
    found.update("item_removed", removed(2, 7)).unwrap();
    found.update("item_removed", removed(1, 2)).unwrap();

    let command = Command::new("remove_item", id, serde_json::json!({}));
    store
        .save(&mut found, &Trigger::Command(&command))
        .await
        .unwrap();

    let replayed = store.find::<FakeItems>(id).await.unwrap().unwrap();
    assert_eq!(replayed.state().quantities[&1], 13);
    assert_eq!(replayed.state().quantities[&2], 3);
    assert_eq!(replayed.version(), 5);

    // version contiguity
    let versions: Vec<i64> =
        sqlx::query_scalar("SELECT version FROM events WHERE aggregate_id = $1 ORDER BY version")
            .bind(id)
            .fetch_all(&pool)
            .await
            .unwrap();
    assert_eq!(versions, vec![1, 2, 3, 4, 5]);
}

#[tokio::test]
async fn test_optimistic_concurrency_conflict() {
    let Some(pool) = try_setup_db().await else { return };
    let id = Uuid::new_v4();
    let (store, _bus) = store_with_bus(pool.clone());

    let mut seed = AggregateRoot::<FakeItems>::new(id);
    seed.update("item_added", added(1, "x", 10)).unwrap();
    seed.update("item_added", added(2, "y", 10)).unwrap();
    seed.update("item_added", added(1, "x", 5)).unwrap();
    let command = Command::new("add_item", id, serde_json::json!({}));
    store
        .save(&mut seed, &Trigger::Command(&command))
        .await
        .unwrap();

    // two in-memory copies of the same aggregate, both at version 3
    let mut first = store.find::<FakeItems>(id).await.unwrap().unwrap();
    let mut second = store.find::<FakeItems>(id).await.unwrap().unwrap();
    assert_eq!(first.version(), 3);
    assert_eq!(second.version(), 3);

    first.update("item_added", added(3, "z", 1)).unwrap();
    second.update("item_added", added(4, "w", 2)).unwrap();

    let winning = Command::new("add_item", id, serde_json::json!({}));
    store
        .save(&mut first, &Trigger::Command(&winning))
        .await
        .unwrap();

    let losing = Command::new("add_item", id, serde_json::json!({}));
    let err = store
        .save(&mut second, &Trigger::Command(&losing))
        .await
        .unwrap_err();
    assert!(err.is_concurrency_conflict());

    // the snapshot entry went stale; the next find reads the tail and
    // reflects only the winning save
    let after = store.find::<FakeItems>(id).await.unwrap().unwrap();
    assert_eq!(after.version(), 4);
    assert_eq!(after.state().quantities.get(&3), Some(&1));
    assert_eq!(after.state().quantities.get(&4), None);
}

#[tokio::test]
async fn test_find_missing_returns_none_and_get_fails() {
    let Some(pool) = try_setup_db().await else { return };
    let (store, _bus) = store_with_bus(pool);
    let id = Uuid::new_v4();

    assert!(store.find::<FakeItems>(id).await.unwrap().is_none());

    let err = store.get::<FakeItems>(id).await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_save_without_pending_events_is_a_noop() {
    let Some(pool) = try_setup_db().await else { return };
    let (store, bus) = store_with_bus(pool.clone());
    let id = Uuid::new_v4();

    let mut root = AggregateRoot::<FakeItems>::new(id);
    let command = Command::new("add_item", id, serde_json::json!({}));
    store
        .save(&mut root, &Trigger::Command(&command))
        .await
        .unwrap();

    assert!(store.find::<FakeItems>(id).await.unwrap().is_none());
    assert!(bus.drain_events().is_empty());
}

#[tokio::test]
async fn test_saga_commands_copublished_on_save() {
    let Some(pool) = try_setup_db().await else { return };
    let (store, bus) = store_with_bus(pool);
    let id = Uuid::new_v4();

    let mut root = AggregateRoot::<FakeItems>::new(id);
    root.update("item_added", added(1, "x", 10)).unwrap();
    root.issue(Command::new(
        "restock_item",
        Uuid::new_v4(),
        serde_json::json!({"id": 1}),
    ));

    let command = Command::new("add_item", id, serde_json::json!({}));
    store
        .save(&mut root, &Trigger::Command(&command))
        .await
        .unwrap();

    let commands = bus.drain_commands();
    assert_eq!(commands.len(), 1);
    assert_eq!(commands[0].command_type, "restock_item");
    assert_eq!(bus.drain_events().len(), 1);
}

#[tokio::test]
async fn test_cold_load_uses_snapshot_row_plus_tail() {
    let Some(pool) = try_setup_db().await else { return };
    let id = Uuid::new_v4();
    let (store, _bus) = store_with_bus(pool.clone());

    let mut root = AggregateRoot::<FakeItems>::new(id);
    root.update("item_added", added(1, "x", 10)).unwrap();
    root.update("item_added", added(2, "y", 4)).unwrap();
    let command = Command::new("add_item", id, serde_json::json!({}));
    store
        .save(&mut root, &Trigger::Command(&command))
        .await
        .unwrap();

    let snapshot_version: Option<i64> = sqlx::query_scalar(
        "SELECT version FROM event_snapshots WHERE aggregate_id = $1 AND aggregate_type = 'FakeItems'",
    )
    .bind(id)
    .fetch_optional(&pool)
    .await
    .unwrap();
    assert_eq!(snapshot_version, Some(2));

    // a new store instance has a cold cache: snapshot row plus event tail
    let (cold_store, _bus) = store_with_bus(pool.clone());
    let mut loaded = cold_store.find::<FakeItems>(id).await.unwrap().unwrap();
    assert_eq!(loaded.version(), 2);
    assert_eq!(loaded.state().quantities[&1], 10);

    // extend the stream, then force tail reads with a zero freshness window
    loaded.update("item_added", added(1, "x", 1)).unwrap();
    let command = Command::new("add_item", id, serde_json::json!({}));
    cold_store
        .save(&mut loaded, &Trigger::Command(&command))
        .await
        .unwrap();

    let (strict_store, _bus) = store_with_bus(pool);
    let strict_store = strict_store.with_freshness(Duration::ZERO);
    let reread = strict_store.find::<FakeItems>(id).await.unwrap().unwrap();
    assert_eq!(reread.version(), 3);
    assert_eq!(reread.state().quantities[&1], 11);
}

#[tokio::test]
async fn test_sql_outbox_sees_exactly_committed_saves() {
    let Some(pool) = try_setup_db().await else { return };
    let id = Uuid::new_v4();

    let outbox = Arc::new(SqlOutboxBus::new());
    let store = EventStore::new(
        pool.clone(),
        Arc::clone(&outbox) as Arc<dyn EventBus>,
        outbox as Arc<dyn CommandBus>,
    )
    .unwrap();

    let mut root = AggregateRoot::<FakeItems>::new(id);
    root.update("item_added", added(1, "x", 10)).unwrap();
    let command = Command::new("add_item", id, serde_json::json!({}));
    store
        .save(&mut root, &Trigger::Command(&command))
        .await
        .unwrap();

    let committed: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM outbox_events WHERE message_id = $1")
            .bind(format!("{}_1", id))
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(committed, 1);

    // a conflicting save rolls back without leaving outbox rows
    let mut stale = AggregateRoot::<FakeItems>::new(id);
    stale.update("item_added", added(9, "q", 1)).unwrap();
    let command = Command::new("add_item", id, serde_json::json!({}));
    let err = store
        .save(&mut stale, &Trigger::Command(&command))
        .await
        .unwrap_err();
    assert!(err.is_concurrency_conflict());

    let after_conflict: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM outbox_events WHERE message_id = $1")
            .bind(format!("{}_1", id))
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(after_conflict, 1);
}
