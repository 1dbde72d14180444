// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cross-relay forwarding.
//!
//! A device attached to several relays is the only path between them. The
//! scanner pushes column stamps above a backend's push cursor, but a remote
//! change merged from one relay can carry a stamp that another relay's
//! cursor has already passed. Such a cell would never be scanned for that
//! relay again.
//!
//! [`ForwardRouter::route`] runs for every remotely merged column, under the
//! commit gate. For each other tracked backend it compares the stamp with
//! the backend's watermark: the higher of its persisted push cursor and the
//! ceiling of a push currently in flight. A stamp at or below the watermark
//! is queued in the store and submitted by that backend's next push,
//! alongside the scan.
//!
//! The in-flight ceiling is registered under the exclusive commit gate, so a
//! merge either committed before the scan snapshot or sees the window. The
//! window is released only after the cursor has moved, so a merge that no
//! longer sees it reads the new cursor.

use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::change::{ChangeCandidate, ChangeKey};
use crate::error::SyncError;
use crate::hlc::Hlc;
use crate::storage::traits::{ForwardedChange, ReplicaStore, StorageError};

pub struct ForwardRouter {
    store: Arc<dyn ReplicaStore>,
    /// Backends that receive forwarded cells
    targets: RwLock<BTreeSet<String>>,
    /// Scan ceilings of pushes in flight, by backend
    windows: DashMap<String, Hlc>,
}

/// Keeps a push's scan ceiling visible to [`ForwardRouter::route`] until dropped.
#[must_use]
pub struct PushWindow<'a> {
    router: &'a ForwardRouter,
    backend_id: String,
}

impl Drop for PushWindow<'_> {
    fn drop(&mut self) {
        self.router.windows.remove(&self.backend_id);
    }
}

/// Cells queued for one backend, resolved against the current rows.
#[derive(Debug, Default)]
pub struct PendingForward {
    pub candidates: Vec<ChangeCandidate>,
    pub entries: Vec<ForwardedChange>,
}

impl ForwardRouter {
    pub fn new(store: Arc<dyn ReplicaStore>) -> Self {
        Self { store, targets: RwLock::new(BTreeSet::new()), windows: DashMap::new() }
    }

    pub fn track(&self, backend_id: &str) {
        self.targets.write().insert(backend_id.to_string());
    }

    pub fn untrack(&self, backend_id: &str) {
        self.targets.write().remove(backend_id);
    }

    #[must_use]
    pub fn is_tracked(&self, backend_id: &str) -> bool {
        self.targets.read().contains(backend_id)
    }

    /// Register `ceiling` as the scan ceiling of a push to `backend_id`.
    ///
    /// Call while holding the exclusive commit gate.
    pub fn open_window(&self, backend_id: &str, ceiling: Hlc) -> PushWindow<'_> {
        self.windows.insert(backend_id.to_string(), ceiling);
        PushWindow { router: self, backend_id: backend_id.to_string() }
    }

    /// Queue merged columns of one row for every tracked backend other than
    /// `source` whose watermark has already passed them. Returns the number
    /// of cells queued.
    pub async fn route(
        &self,
        source: Option<&str>,
        table: &str,
        id: Uuid,
        columns: &[(String, Hlc)],
    ) -> Result<usize, StorageError> {
        if columns.is_empty() {
            return Ok(0);
        }
        let targets: Vec<String> = self
            .targets
            .read()
            .iter()
            .filter(|backend| source != Some(backend.as_str()))
            .cloned()
            .collect();

        let row_pk = id.to_string();
        let mut queued = 0;
        for backend_id in targets {
            // Window before cursor: the window is released only after the cursor moved.
            let window = self.windows.get(&backend_id).map(|w| *w);
            let pushed = self.store.load_cursor(&backend_id).await?.and_then(|c| c.last_push_hlc);
            let watermark = window.max(pushed);

            for (column, hlc) in columns {
                if Some(*hlc) > watermark {
                    continue;
                }
                self.store
                    .forward_change(&ForwardedChange {
                        backend_id: backend_id.clone(),
                        key: ChangeKey { table: table.to_string(), row_pk: row_pk.clone(), column_name: column.clone() },
                        hlc: *hlc,
                    })
                    .await?;
                queued += 1;
                debug!(backend = %backend_id, table = %table, row = %id, column = %column, hlc = %hlc, "Cell queued for forwarding");
            }
        }
        if queued > 0 {
            crate::metrics::record_forwarded(table, queued);
        }
        Ok(queued)
    }

    /// Resolve the queue of `backend_id` into push candidates carrying each
    /// cell's current value and stamp. Entries whose row or column is gone
    /// are dropped.
    pub async fn pending(&self, backend_id: &str) -> Result<PendingForward, SyncError> {
        let mut pending = PendingForward::default();
        for entry in self.store.forwarded_changes(backend_id).await? {
            let Ok(id) = Uuid::parse_str(&entry.key.row_pk) else {
                warn!(backend = %backend_id, row = %entry.key.row_pk, "Dropping forwarded cell with unparseable row key");
                self.store.remove_forwarded(&entry).await?;
                continue;
            };
            let row = self.store.get_row(&entry.key.table, id).await?;
            let Some((value, hlc)) = row.as_ref().and_then(|row| {
                let hlc = *row.column_hlc(&entry.key.column_name)?;
                Some((row.value(&entry.key.column_name).unwrap_or(serde_json::Value::Null), hlc))
            }) else {
                self.store.remove_forwarded(&entry).await?;
                continue;
            };
            pending.candidates.push(ChangeCandidate {
                table: entry.key.table.clone(),
                row_id: id,
                column: entry.key.column_name.clone(),
                hlc,
                value,
            });
            pending.entries.push(entry);
        }
        Ok(pending)
    }

    /// Drop delivered entries. An entry re-queued with a newer stamp stays.
    pub async fn clear(&self, entries: &[ForwardedChange]) -> Result<(), StorageError> {
        for entry in entries {
            self.store.remove_forwarded(entry).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::CursorStore;
    use crate::storage::memory::InMemoryStore;
    use serde_json::json;
    use crate::row::Row;

    fn hlc(physical_ms: u64) -> Hlc {
        Hlc::new(physical_ms, 0, Uuid::from_u128(3))
    }

    struct Fixture {
        store: Arc<InMemoryStore>,
        cursors: CursorStore,
        router: ForwardRouter,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        store.create_table("notes", &["title", "body"]);
        let router = ForwardRouter::new(store.clone());
        router.track("one");
        router.track("two");
        Fixture { cursors: CursorStore::new(store.clone()), store, router }
    }

    async fn stored_row(store: &InMemoryStore, physical_ms: u64) -> Uuid {
        let mut row = Row::new(Uuid::new_v4());
        row.apply_column("title", json!("from one"), hlc(physical_ms)).unwrap();
        store.put_row("notes", &row).await.unwrap();
        row.id
    }

    #[tokio::test]
    async fn test_stamp_below_push_cursor_is_queued_for_other_backends_only() {
        let fx = fixture();
        fx.cursors.advance_push("one", hlc(500)).await.unwrap();
        fx.cursors.advance_push("two", hlc(500)).await.unwrap();
        let id = stored_row(&fx.store, 400).await;

        let queued = fx.router.route(Some("one"), "notes", id, &[("title".into(), hlc(400))]).await.unwrap();
        assert_eq!(queued, 1);
        assert!(fx.store.forwarded_changes("one").await.unwrap().is_empty());

        let pending = fx.router.pending("two").await.unwrap();
        assert_eq!(pending.candidates.len(), 1);
        assert_eq!(pending.candidates[0].value, json!("from one"));
        assert_eq!(pending.candidates[0].hlc, hlc(400));

        fx.router.clear(&pending.entries).await.unwrap();
        assert_eq!(fx.store.forwarded_len(), 0);
    }

    #[tokio::test]
    async fn test_stamp_above_watermark_is_left_to_the_scanner() {
        let fx = fixture();
        fx.cursors.advance_push("two", hlc(300)).await.unwrap();
        let id = stored_row(&fx.store, 400).await;

        let queued = fx.router.route(Some("one"), "notes", id, &[("title".into(), hlc(400))]).await.unwrap();
        assert_eq!(queued, 0);
        // never pushed to two: no cursor, the first cycle scans everything
        fx.router.untrack("two");
        fx.router.track("three");
        let queued = fx.router.route(Some("one"), "notes", id, &[("title".into(), hlc(400))]).await.unwrap();
        assert_eq!(queued, 0);
    }

    #[tokio::test]
    async fn test_open_window_covers_stamps_under_the_ceiling() {
        let fx = fixture();
        let id = stored_row(&fx.store, 400).await;
        {
            let _window = fx.router.open_window("two", hlc(450));
            let queued = fx.router.route(Some("one"), "notes", id, &[("title".into(), hlc(400))]).await.unwrap();
            assert_eq!(queued, 1);
        }
        fx.store.clear_forwarded("two").await.unwrap();
        let queued = fx.router.route(Some("one"), "notes", id, &[("title".into(), hlc(400))]).await.unwrap();
        assert_eq!(queued, 0);
    }

    #[tokio::test]
    async fn test_pending_drops_vanished_rows() {
        let fx = fixture();
        fx.cursors.advance_push("two", hlc(500)).await.unwrap();
        let id = stored_row(&fx.store, 400).await;
        fx.router.route(None, "notes", id, &[("title".into(), hlc(400))]).await.unwrap();
        fx.store.purge_row("notes", id).await.unwrap();

        let pending = fx.router.pending("two").await.unwrap();
        assert!(pending.candidates.is_empty());
        assert!(fx.store.forwarded_changes("two").await.unwrap().is_empty());
    }
}
