// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Dirty-table tracking.
//!
//! The store bumps a per-table generation on every insert or update. A table
//! is a push candidate while its generation is ahead of the last generation
//! confirmed on every enabled backend. The tracker is only a hint; the
//! scanner decides which columns actually changed.
//!
//! Clearing is two-phase:
//!
//! ```text
//! backend A push ok ──► confirm(A, t, g) ─┐
//! backend B push ok ──► confirm(B, t, g) ─┼─► try_clear(t) ──► store.clear_dirty(t, g)
//!                       no push in flight ┘                    (no-op if t moved past g)
//! ```

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::storage::traits::{ReplicaStore, StorageError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirtyTableEntry {
    pub table_name: String,
    /// Epoch millis of the most recent write
    pub last_modified: i64,
    /// Write counter at the time the entry was read
    pub generation: u64,
}

#[derive(Default)]
struct TrackerState {
    in_flight: HashMap<String, usize>,
    /// table → backend → highest confirmed generation
    confirmed: HashMap<String, HashMap<String, u64>>,
}

pub struct DirtyTracker {
    store: Arc<dyn ReplicaStore>,
    state: Mutex<TrackerState>,
}

impl DirtyTracker {
    pub fn new(store: Arc<dyn ReplicaStore>) -> Self {
        Self { store, state: Mutex::new(TrackerState::default()) }
    }

    /// Current candidate tables.
    pub async fn dirty_tables(&self) -> Result<Vec<DirtyTableEntry>, StorageError> {
        let entries = self.store.dirty_tables().await?;
        crate::metrics::set_dirty_tables(entries.len());
        Ok(entries)
    }

    /// Mark pushes of `tables` in flight until the guard drops.
    pub fn begin_push(&self, tables: impl IntoIterator<Item = String>) -> PushGuard<'_> {
        let tables: Vec<String> = tables.into_iter().collect();
        let mut state = self.state.lock();
        for table in &tables {
            *state.in_flight.entry(table.clone()).or_default() += 1;
        }
        PushGuard { tracker: self, tables }
    }

    #[must_use]
    pub fn in_flight(&self, table: &str) -> usize {
        self.state.lock().in_flight.get(table).copied().unwrap_or(0)
    }

    /// Record that `backend` holds everything in `table` up to `generation`.
    pub fn confirm(&self, backend: &str, table: &str, generation: u64) {
        let mut state = self.state.lock();
        let confirmed = state
            .confirmed
            .entry(table.to_string())
            .or_default()
            .entry(backend.to_string())
            .or_default();
        *confirmed = (*confirmed).max(generation);
    }

    /// Clear `table` if every enabled backend confirmed it and no push is in flight.
    pub async fn try_clear(&self, table: &str, enabled_backends: &[String]) -> Result<bool, StorageError> {
        let generation = {
            let state = self.state.lock();
            if state.in_flight.get(table).copied().unwrap_or(0) > 0 || enabled_backends.is_empty() {
                return Ok(false);
            }
            let Some(confirmed) = state.confirmed.get(table) else {
                return Ok(false);
            };
            let mut min = u64::MAX;
            for backend in enabled_backends {
                match confirmed.get(backend) {
                    Some(generation) => min = min.min(*generation),
                    None => return Ok(false),
                }
            }
            min
        };

        let cleared = self.store.clear_dirty(table, generation).await?;
        if cleared {
            debug!(table = %table, generation, "Dirty marker cleared on all enabled backends");
        } else {
            debug!(table = %table, generation, "Table written again since confirmation; stays dirty");
        }
        Ok(cleared)
    }

    /// Drop confirmations held for a removed backend.
    pub fn forget_backend(&self, backend: &str) {
        let mut state = self.state.lock();
        for confirmed in state.confirmed.values_mut() {
            confirmed.remove(backend);
        }
    }
}

/// Releases in-flight push markers on drop, including on error or cancellation.
pub struct PushGuard<'a> {
    tracker: &'a DirtyTracker,
    tables: Vec<String>,
}

impl Drop for PushGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.tracker.state.lock();
        for table in &self.tables {
            if let Some(count) = state.in_flight.get_mut(table) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    state.in_flight.remove(table);
                }
            }
        }
    }
}
