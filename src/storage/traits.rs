// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::change::{ChangeKey, ColumnChange};
use crate::cursor::BackendCursor;
use crate::dirty::DirtyTableEntry;
use crate::hlc::Hlc;
use crate::row::Row;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Item not found")]
    NotFound,
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Schema error: {0}")]
    Schema(String),
    #[error("Corrupt replication metadata in '{table}' row {id}: {reason}")]
    Corruption {
        table: String,
        id: String,
        reason: String,
    },
}

/// Keyset-paginated scan of rows ordered by `(row_timestamp, id)`.
#[derive(Debug, Clone, Default)]
pub struct ScanQuery {
    /// Only rows with `row_timestamp > since` (all rows when `None`)
    pub since: Option<Hlc>,
    /// Resume strictly after this `(row_timestamp, id)` position
    pub after: Option<(Hlc, Uuid)>,
    pub limit: usize,
}

/// A pulled change parked until the local schema knows its table/column,
/// or until its value can be opened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeferredChange {
    pub change: ColumnChange,
    pub backend_id: String,
    pub server_timestamp: i64,
    pub reason: String,
}

impl DeferredChange {
    #[must_use]
    pub fn position(&self) -> DeferredPosition {
        DeferredPosition { server_timestamp: self.server_timestamp, key: self.change.key() }
    }
}

/// Resume point in the deferred area, ordered by `(server_timestamp, key)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct DeferredPosition {
    pub server_timestamp: i64,
    pub key: ChangeKey,
}

/// A merged cell queued for a backend whose push cursor had already passed
/// its stamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardedChange {
    pub backend_id: String,
    pub key: ChangeKey,
    pub hlc: Hlc,
}

/// Local relational store as seen by the replication engine.
///
/// Implementations must make [`put_row`](Self::put_row) atomic per row and
/// fire the dirty-table hook from inside the same write.
#[async_trait]
pub trait ReplicaStore: Send + Sync {
    // ─── Schema ────────────────────────────────────────────────────────────

    /// Re-run replicated-table discovery. Stores without a live schema keep
    /// the default no-op.
    async fn refresh_schema(&self) -> Result<(), StorageError> {
        Ok(())
    }

    /// Tables carrying the replication columns.
    async fn replicated_tables(&self) -> Result<Vec<String>, StorageError>;

    /// Replicated columns of a table (data columns plus `tombstone`), or
    /// `None` if the table is unknown or not replicated.
    async fn table_columns(&self, table: &str) -> Result<Option<Vec<String>>, StorageError>;

    // ─── Rows ──────────────────────────────────────────────────────────────

    async fn get_row(&self, table: &str, id: Uuid) -> Result<Option<Row>, StorageError>;

    /// Insert or replace a row and mark its table dirty.
    async fn put_row(&self, table: &str, row: &Row) -> Result<(), StorageError>;

    async fn scan_rows(&self, table: &str, query: &ScanQuery) -> Result<Vec<Row>, StorageError>;

    /// Tombstoned rows ordered by id, resuming after `after`.
    async fn tombstoned_rows(
        &self,
        table: &str,
        after: Option<Uuid>,
        limit: usize,
    ) -> Result<Vec<Row>, StorageError>;

    /// Physically delete a row. Does not mark the table dirty.
    async fn purge_row(&self, table: &str, id: Uuid) -> Result<bool, StorageError>;

    /// Highest `row_timestamp` across all replicated tables.
    async fn max_row_timestamp(&self) -> Result<Option<Hlc>, StorageError> {
        let mut max = None;
        for table in self.replicated_tables().await? {
            let rows = self
                .scan_rows(&table, &ScanQuery { since: max, after: None, limit: usize::MAX })
                .await?;
            if let Some(found) = rows.iter().filter_map(|r| r.row_timestamp).max() {
                max = Some(found);
            }
        }
        Ok(max)
    }

    // ─── Dirty tables ──────────────────────────────────────────────────────

    /// Tables written since they were last confirmed synchronized.
    async fn dirty_tables(&self) -> Result<Vec<DirtyTableEntry>, StorageError>;

    /// Mark a table clean as of `generation`.
    ///
    /// Has no effect (returns `false`) if the table was written again since
    /// `generation` was read.
    async fn clear_dirty(&self, table: &str, generation: u64) -> Result<bool, StorageError>;

    // ─── Backend cursors ───────────────────────────────────────────────────

    async fn load_cursor(&self, backend_id: &str) -> Result<Option<BackendCursor>, StorageError>;

    async fn load_cursors(&self) -> Result<Vec<BackendCursor>, StorageError>;

    async fn save_cursor(&self, cursor: &BackendCursor) -> Result<(), StorageError>;

    async fn delete_cursor(&self, backend_id: &str) -> Result<(), StorageError>;

    // ─── Deferred changes ──────────────────────────────────────────────────

    /// Park a change, keeping only the highest stamp per cell.
    async fn defer_change(&self, deferred: &DeferredChange) -> Result<(), StorageError>;

    /// Parked changes strictly after `after`, in position order.
    async fn deferred_changes(
        &self,
        after: Option<&DeferredPosition>,
        limit: usize,
    ) -> Result<Vec<DeferredChange>, StorageError>;

    /// Drop a parked change if it is still the one stamped `hlc`.
    async fn remove_deferred(&self, key: &ChangeKey, hlc: &Hlc) -> Result<(), StorageError>;

    // ─── Forwarded changes ─────────────────────────────────────────────────

    /// Queue a cell for a backend, keeping only the highest stamp per cell.
    async fn forward_change(&self, forwarded: &ForwardedChange) -> Result<(), StorageError>;

    /// Every cell queued for `backend_id`, ordered by key.
    async fn forwarded_changes(&self, backend_id: &str) -> Result<Vec<ForwardedChange>, StorageError>;

    /// Drop a queued cell if it is still the one stamped `forwarded.hlc`.
    async fn remove_forwarded(&self, forwarded: &ForwardedChange) -> Result<(), StorageError>;

    /// Backends that still have a cell of this row queued, sorted.
    async fn forwarded_backends(&self, table: &str, row_pk: &str) -> Result<Vec<String>, StorageError>;

    /// Forget everything queued for `backend_id`.
    async fn clear_forwarded(&self, backend_id: &str) -> Result<(), StorageError>;

    // ─── Metadata ──────────────────────────────────────────────────────────

    async fn get_meta(&self, key: &str) -> Result<Option<String>, StorageError>;

    async fn set_meta(&self, key: &str, value: &str) -> Result<(), StorageError>;
}
