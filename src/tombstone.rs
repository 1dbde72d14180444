// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Tombstone garbage collection.
//!
//! A delete is just `tombstone = true` with a column stamp, so it replicates
//! and conflicts like any other write. Physically removing the row throws
//! that stamp away, which is only safe once no enabled backend can still be
//! missing it:
//!
//! - every enabled backend has pushed and pulled at least once
//! - `row_timestamp <= min(last_push_hlc)` across enabled backends
//! - the tombstone stamp is older than the retention window
//! - no enabled backend still has a cell of the row queued for forwarding
//!
//! With no enabled backends there is no horizon and nothing is purged.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use crate::cursor::CursorStore;
use crate::error::SyncError;
use crate::hlc::Hlc;
use crate::locks::ReplicaLocks;
use crate::row::Row;
use crate::storage::traits::ReplicaStore;

/// Outcome of one collection pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcReport {
    /// Convergence horizon used, `None` if the pass was skipped
    pub horizon: Option<Hlc>,
    /// Tombstoned rows looked at
    pub examined: usize,
    pub purged: usize,
    /// Why the pass did nothing, if it did nothing
    pub skipped: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Horizon {
    Converged(Hlc),
    /// Some enabled backend cannot vouch for any stamp yet
    Blocked(String),
}

pub struct TombstoneManager {
    store: Arc<dyn ReplicaStore>,
    locks: Arc<ReplicaLocks>,
    retention: Duration,
    page_size: usize,
}

impl TombstoneManager {
    pub fn new(store: Arc<dyn ReplicaStore>, locks: Arc<ReplicaLocks>, retention: Duration, page_size: usize) -> Self {
        Self { store, locks, retention, page_size: page_size.max(1) }
    }

    /// The highest stamp every enabled backend has provably received.
    pub async fn horizon(&self, cursors: &CursorStore, enabled_backends: &[String]) -> Result<Horizon, SyncError> {
        let mut horizon: Option<Hlc> = None;
        for backend in enabled_backends {
            let Some(cursor) = cursors.get(backend).await? else {
                return Ok(Horizon::Blocked(format!("backend '{backend}' has never synced")));
            };
            match cursor.last_push_hlc {
                Some(pushed) if cursor.is_converged() => {
                    horizon = Some(horizon.map_or(pushed, |h| h.min(pushed)));
                }
                _ => return Ok(Horizon::Blocked(format!("backend '{backend}' has not converged"))),
            }
        }
        Ok(match horizon {
            Some(hlc) => Horizon::Converged(hlc),
            None => Horizon::Blocked("no enabled backends".into()),
        })
    }

    /// Purge tombstoned rows every enabled backend has converged past.
    pub async fn collect_garbage(
        &self,
        cursors: &CursorStore,
        enabled_backends: &[String],
        now_ms: u64,
    ) -> Result<GcReport, SyncError> {
        let horizon = match self.horizon(cursors, enabled_backends).await? {
            Horizon::Converged(horizon) => horizon,
            Horizon::Blocked(reason) => {
                debug!(reason = %reason, "Tombstone collection skipped");
                return Ok(GcReport { skipped: Some(reason), ..Default::default() });
            }
        };
        let retention_ms = u64::try_from(self.retention.as_millis()).unwrap_or(u64::MAX);
        let mut report = GcReport { horizon: Some(horizon), ..Default::default() };

        for table in self.store.replicated_tables().await? {
            let mut after: Option<Uuid> = None;
            let mut purged_here = 0usize;
            loop {
                let rows = self.store.tombstoned_rows(&table, after, self.page_size).await?;
                let page_len = rows.len();
                after = rows.last().map(|row| row.id);
                report.examined += page_len;

                for row in rows {
                    if !purgeable(&row, &horizon, now_ms, retention_ms) {
                        continue;
                    }
                    let _row_lock = self.locks.lock_row(&table, row.id).await;
                    // The row may have been restored or edited since the page was read.
                    let still_purgeable = self
                        .store
                        .get_row(&table, row.id)
                        .await?
                        .is_some_and(|current| purgeable(&current, &horizon, now_ms, retention_ms));
                    if !still_purgeable {
                        continue;
                    }
                    let owed = self.store.forwarded_backends(&table, &row.id.to_string()).await?;
                    if owed.iter().any(|backend| enabled_backends.contains(backend)) {
                        debug!(table = %table, row = %row.id, "Tombstone still queued for forwarding");
                        continue;
                    }
                    if self.store.purge_row(&table, row.id).await? {
                        purged_here += 1;
                        debug!(table = %table, row = %row.id, "Tombstone purged");
                    }
                }

                if page_len < self.page_size {
                    break;
                }
            }
            if purged_here > 0 {
                crate::metrics::record_tombstones_purged(&table, purged_here);
            }
            report.purged += purged_here;
        }

        info!(
            horizon = %horizon,
            examined = report.examined,
            purged = report.purged,
            "Tombstone collection complete"
        );
        Ok(report)
    }
}

/// Deleted, converged on every enabled backend, and past retention.
#[must_use]
pub fn purgeable(row: &Row, horizon: &Hlc, now_ms: u64, retention_ms: u64) -> bool {
    if !row.is_deleted() {
        return false;
    }
    let (Some(row_timestamp), Some(deleted_at)) = (row.row_timestamp, row.tombstone_hlc()) else {
        return false;
    };
    row_timestamp <= *horizon && deleted_at.physical_ms.saturating_add(retention_ms) <= now_ms
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::InMemoryStore;
    use serde_json::json;

    const DAY_MS: u64 = 24 * 3600 * 1000;

    fn hlc(physical_ms: u64) -> Hlc {
        Hlc::new(physical_ms, 0, Uuid::nil())
    }

    fn deleted_row(created_ms: u64, deleted_ms: u64) -> Row {
        let mut row = Row::new(Uuid::new_v4());
        row.apply_column("title", json!("t"), hlc(created_ms)).unwrap();
        row.apply_column("tombstone", json!(true), hlc(deleted_ms)).unwrap();
        row
    }

    struct Fixture {
        store: Arc<InMemoryStore>,
        cursors: CursorStore,
        gc: TombstoneManager,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        store.create_table("notes", &["title"]);
        Fixture {
            cursors: CursorStore::new(store.clone()),
            gc: TombstoneManager::new(store.clone(), Arc::new(ReplicaLocks::new(4)), Duration::from_millis(DAY_MS), 2),
            store,
        }
    }

    #[test]
    fn test_purgeable_rules() {
        let row = deleted_row(10, 20);
        assert!(purgeable(&row, &hlc(20), 20 + DAY_MS, DAY_MS));
        // not converged past the delete
        assert!(!purgeable(&row, &hlc(19), 20 + DAY_MS, DAY_MS));
        // inside retention
        assert!(!purgeable(&row, &hlc(20), 20 + DAY_MS - 1, DAY_MS));

        let mut restored = row.clone();
        restored.apply_column("tombstone", json!(false), hlc(30)).unwrap();
        assert!(!purgeable(&restored, &hlc(100), 100 * DAY_MS, DAY_MS));

        let mut revived = row.clone();
        revived.apply_column("title", json!("back"), hlc(25)).unwrap();
        assert!(!purgeable(&revived, &hlc(100), 100 * DAY_MS, DAY_MS));
    }

    #[tokio::test]
    async fn test_no_backends_means_no_purge() {
        let fx = fixture();
        fx.store.put_row("notes", &deleted_row(1, 2)).await.unwrap();
        let report = fx.gc.collect_garbage(&fx.cursors, &[], 100 * DAY_MS).await.unwrap();
        assert_eq!(report.purged, 0);
        assert!(report.skipped.is_some());
        assert_eq!(fx.store.row_count("notes"), 1);
    }

    #[tokio::test]
    async fn test_unconverged_backend_blocks_purge() {
        let fx = fixture();
        fx.store.put_row("notes", &deleted_row(1, 2)).await.unwrap();
        fx.cursors.advance_push("a", hlc(1_000)).await.unwrap();

        let report = fx.gc.collect_garbage(&fx.cursors, &["a".to_string()], 100 * DAY_MS).await.unwrap();
        assert_eq!(report.purged, 0);
        assert!(report.skipped.unwrap().contains("not converged"));
    }

    #[tokio::test]
    async fn test_purges_only_behind_slowest_backend() {
        let fx = fixture();
        let old = deleted_row(1, 2);
        let newer = deleted_row(3, 500);
        let live = {
            let mut row = Row::new(Uuid::new_v4());
            row.apply_column("title", json!("keep"), hlc(1)).unwrap();
            row
        };
        for row in [&old, &newer, &live] {
            fx.store.put_row("notes", row).await.unwrap();
        }
        for (backend, pushed) in [("a", 1_000), ("b", 100)] {
            fx.cursors.advance_push(backend, hlc(pushed)).await.unwrap();
            fx.cursors.advance_pull(backend, 0).await.unwrap();
        }

        let enabled = vec!["a".to_string(), "b".to_string()];
        let report = fx.gc.collect_garbage(&fx.cursors, &enabled, 100 * DAY_MS).await.unwrap();
        assert_eq!(report.horizon, Some(hlc(100)));
        assert_eq!(report.examined, 2);
        assert_eq!(report.purged, 1);
        assert!(fx.store.get_row("notes", old.id).await.unwrap().is_none());
        assert!(fx.store.get_row("notes", newer.id).await.unwrap().is_some());
        assert!(fx.store.get_row("notes", live.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_cell_queued_for_forwarding_blocks_purge() {
        use crate::change::ChangeKey;
        use crate::storage::traits::ForwardedChange;

        let fx = fixture();
        let row = deleted_row(1, 2);
        fx.store.put_row("notes", &row).await.unwrap();
        fx.cursors.advance_push("a", hlc(1_000)).await.unwrap();
        fx.cursors.advance_pull("a", 0).await.unwrap();
        let queued = ForwardedChange {
            backend_id: "a".into(),
            key: ChangeKey { table: "notes".into(), row_pk: row.id.to_string(), column_name: "tombstone".into() },
            hlc: hlc(2),
        };
        fx.store.forward_change(&queued).await.unwrap();

        let enabled = vec!["a".to_string()];
        let report = fx.gc.collect_garbage(&fx.cursors, &enabled, 100 * DAY_MS).await.unwrap();
        assert_eq!(report.purged, 0);

        // entries owed to a backend that is no longer enabled do not count
        let removed = ForwardedChange { backend_id: "removed".into(), ..queued.clone() };
        fx.store.forward_change(&removed).await.unwrap();
        fx.store.remove_forwarded(&queued).await.unwrap();
        let report = fx.gc.collect_garbage(&fx.cursors, &enabled, 100 * DAY_MS).await.unwrap();
        assert_eq!(report.purged, 1);
    }
}
