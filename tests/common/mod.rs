//! Common test utilities

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPoolOptions;
use sqlx::{Executor, PgPool};

use eventline::aggregate::{AggregateState, RehydratorTable};

/// Connect to the test database and make sure the schema exists.
/// Returns `None` (skipping the test) when DATABASE_URL is not set.
pub async fn try_setup_db() -> Option<PgPool> {
    dotenvy::dotenv().ok();
    let Ok(database_url) = std::env::var("DATABASE_URL") else {
        eprintln!("DATABASE_URL not set; skipping integration test");
        return None;
    };

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .expect("Failed to connect to DB");

    pool.execute(include_str!("../../migrations/001_initial.sql"))
        .await
        .expect("Failed to ensure schema");

    Some(pool)
}

/// Remove every row belonging to one aggregate so tests stay independent
/// under parallel execution.
pub async fn clear_aggregate(pool: &PgPool, id: uuid::Uuid) {
    sqlx::query("DELETE FROM events WHERE aggregate_id = $1")
        .bind(id)
        .execute(pool)
        .await
        .expect("Failed to clear events");
    sqlx::query("DELETE FROM event_snapshots WHERE aggregate_id = $1")
        .bind(id)
        .execute(pool)
        .await
        .expect("Failed to clear snapshots");
}

/// Test aggregate tracking item quantities.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FakeItems {
    pub quantities: BTreeMap<i64, i64>,
    pub names: BTreeMap<i64, String>,
}

impl AggregateState for FakeItems {
    fn source_type() -> &'static str {
        "FakeItems"
    }

    fn rehydrators() -> RehydratorTable<Self> {
        RehydratorTable::new()
            .on("item_added", |state: &mut Self, payload| {
                let id = payload["id"].as_i64().unwrap_or_default();
                let qty = payload["qty"].as_i64().unwrap_or_default();
                *state.quantities.entry(id).or_insert(0) += qty;
                if let Some(name) = payload["name"].as_str() {
                    state.names.insert(id, name.to_string());
                }
                Ok(())
            })
            .on("item_removed", |state: &mut Self, payload| {
                let id = payload["id"].as_i64().unwrap_or_default();
                let qty = payload["qty"].as_i64().unwrap_or_default();
                *state.quantities.entry(id).or_insert(0) -= qty;
                Ok(())
            })
    }

    fn snapshotting() -> bool {
        true
    }

    fn memento(&self) -> Option<serde_json::Value> {
        serde_json::to_value(self).ok()
    }

    fn restore(payload: &serde_json::Value) -> Option<Self> {
        serde_json::from_value(payload.clone()).ok()
    }
}

pub fn added(id: i64, name: &str, qty: i64) -> serde_json::Value {
    serde_json::json!({"id": id, "name": name, "qty": qty})
}

pub fn removed(id: i64, qty: i64) -> serde_json::Value {
    serde_json::json!({"id": id, "qty": qty})
}
