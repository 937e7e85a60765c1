//! Snapshot cache
//!
//! In-process accelerator for aggregate loads, keyed by aggregate type and
//! id. An entry refreshed within the freshness window lets the store skip
//! the event-tail read; a stale or never-refreshed entry forces it. Shared
//! across processing rounds, so access goes through a mutex; correctness
//! never depends on the cache because the store verifies versions at
//! commit.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::aggregate::Memento;

#[derive(Debug, Clone)]
struct CacheEntry {
    memento: Memento,
    last_refresh_at: Option<Instant>,
}

/// Keyed store `(aggregate_type, id) → (memento, last_refresh_at)`.
#[derive(Debug, Default)]
pub struct SnapshotCache {
    entries: Mutex<HashMap<(String, Uuid), CacheEntry>>,
}

impl SnapshotCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The cached memento and whether it is fresh within `window`.
    pub fn get(
        &self,
        aggregate_type: &str,
        id: Uuid,
        window: Duration,
    ) -> Option<(Memento, bool)> {
        let entries = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        entries.get(&(aggregate_type.to_string(), id)).map(|entry| {
            let fresh = entry
                .last_refresh_at
                .map(|at| at.elapsed() <= window)
                .unwrap_or(false);
            (entry.memento.clone(), fresh)
        })
    }

    /// Store a memento. `refreshed_at = None` records an entry that is
    /// usable but never fresh (e.g. loaded from the snapshots table).
    pub fn set(
        &self,
        aggregate_type: &str,
        id: Uuid,
        memento: Memento,
        refreshed_at: Option<Instant>,
    ) {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        entries.insert(
            (aggregate_type.to_string(), id),
            CacheEntry {
                memento,
                last_refresh_at: refreshed_at,
            },
        );
    }

    /// Forget the refresh time so the next load reads the event tail.
    pub fn mark_stale(&self, aggregate_type: &str, id: Uuid) {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(entry) = entries.get_mut(&(aggregate_type.to_string(), id)) {
            entry.last_refresh_at = None;
        }
    }
}
