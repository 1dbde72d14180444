// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-memory replica store.
//!
//! Reference implementation of [`ReplicaStore`] for tests, demos and
//! ephemeral replicas. Tables are declared up front with
//! [`InMemoryStore::create_table`]; [`InMemoryStore::add_column`] plays the
//! part of a schema migration.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::BTreeMap;
use uuid::Uuid;

use super::traits::{DeferredChange, DeferredPosition, ForwardedChange, ReplicaStore, ScanQuery, StorageError};
use crate::change::ChangeKey;
use crate::cursor::BackendCursor;
use crate::dirty::DirtyTableEntry;
use crate::hlc::Hlc;
use crate::row::{Row, TOMBSTONE_COLUMN};

struct Table {
    columns: Vec<String>,
    rows: BTreeMap<Uuid, Row>,
}

#[derive(Debug, Default, Clone, Copy)]
struct DirtyState {
    last_modified: i64,
    generation: u64,
    synced_generation: u64,
}

pub struct InMemoryStore {
    tables: DashMap<String, Table>,
    dirty: DashMap<String, DirtyState>,
    cursors: DashMap<String, BackendCursor>,
    deferred: DashMap<ChangeKey, DeferredChange>,
    forwarded: DashMap<(String, ChangeKey), Hlc>,
    meta: DashMap<String, String>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            tables: DashMap::new(),
            dirty: DashMap::new(),
            cursors: DashMap::new(),
            deferred: DashMap::new(),
            forwarded: DashMap::new(),
            meta: DashMap::new(),
        }
    }

    /// Declare a replicated table. The tombstone column is implied.
    pub fn create_table(&self, name: &str, columns: &[&str]) {
        let mut all: Vec<String> = columns.iter().map(|c| c.to_string()).collect();
        if !all.iter().any(|c| c == TOMBSTONE_COLUMN) {
            all.push(TOMBSTONE_COLUMN.to_string());
        }
        self.tables
            .entry(name.to_string())
            .or_insert_with(|| Table { columns: Vec::new(), rows: BTreeMap::new() })
            .columns = all;
    }

    /// Add a column to an existing table. Returns `false` for unknown tables.
    pub fn add_column(&self, table: &str, column: &str) -> bool {
        match self.tables.get_mut(table) {
            Some(mut t) => {
                if !t.columns.iter().any(|c| c == column) {
                    t.columns.push(column.to_string());
                }
                true
            }
            None => false,
        }
    }

    /// Row count of a table (tombstoned rows included).
    #[must_use]
    pub fn row_count(&self, table: &str) -> usize {
        self.tables.get(table).map_or(0, |t| t.rows.len())
    }

    /// Number of parked deferred changes.
    #[must_use]
    pub fn deferred_len(&self) -> usize {
        self.deferred.len()
    }

    /// Number of cells queued for forwarding across all backends.
    #[must_use]
    pub fn forwarded_len(&self) -> usize {
        self.forwarded.len()
    }

    fn mark_dirty(&self, table: &str) {
        let mut state = self.dirty.entry(table.to_string()).or_default();
        state.generation += 1;
        state.last_modified = chrono::Utc::now().timestamp_millis();
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ReplicaStore for InMemoryStore {
    async fn replicated_tables(&self) -> Result<Vec<String>, StorageError> {
        let mut names: Vec<String> = self.tables.iter().map(|t| t.key().clone()).collect();
        names.sort();
        Ok(names)
    }

    async fn table_columns(&self, table: &str) -> Result<Option<Vec<String>>, StorageError> {
        Ok(self.tables.get(table).map(|t| t.columns.clone()))
    }

    async fn get_row(&self, table: &str, id: Uuid) -> Result<Option<Row>, StorageError> {
        Ok(self.tables.get(table).and_then(|t| t.rows.get(&id).cloned()))
    }

    async fn put_row(&self, table: &str, row: &Row) -> Result<(), StorageError> {
        {
            let mut t = self
                .tables
                .get_mut(table)
                .ok_or_else(|| StorageError::Schema(format!("unknown table '{table}'")))?;
            t.rows.insert(row.id, row.clone());
        }
        self.mark_dirty(table);
        Ok(())
    }

    async fn scan_rows(&self, table: &str, query: &ScanQuery) -> Result<Vec<Row>, StorageError> {
        let Some(t) = self.tables.get(table) else {
            return Ok(Vec::new());
        };
        let mut rows: Vec<Row> = t
            .rows
            .values()
            .filter(|row| match (row.row_timestamp, query.since) {
                (None, _) => false,
                (Some(ts), Some(since)) => ts > since,
                (Some(_), None) => true,
            })
            .filter(|row| match (row.row_timestamp, query.after) {
                (Some(ts), Some(after)) => (ts, row.id) > after,
                _ => true,
            })
            .cloned()
            .collect();
        rows.sort_by_key(|row| (row.row_timestamp, row.id));
        rows.truncate(query.limit);
        Ok(rows)
    }

    async fn tombstoned_rows(
        &self,
        table: &str,
        after: Option<Uuid>,
        limit: usize,
    ) -> Result<Vec<Row>, StorageError> {
        let Some(t) = self.tables.get(table) else {
            return Ok(Vec::new());
        };
        Ok(t.rows
            .values()
            .filter(|row| row.tombstone && after.map_or(true, |after| row.id > after))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn purge_row(&self, table: &str, id: Uuid) -> Result<bool, StorageError> {
        Ok(self
            .tables
            .get_mut(table)
            .is_some_and(|mut t| t.rows.remove(&id).is_some()))
    }

    async fn max_row_timestamp(&self) -> Result<Option<Hlc>, StorageError> {
        Ok(self
            .tables
            .iter()
            .filter_map(|t| t.rows.values().filter_map(|row| row.row_timestamp).max())
            .max())
    }

    async fn dirty_tables(&self) -> Result<Vec<DirtyTableEntry>, StorageError> {
        let mut entries: Vec<DirtyTableEntry> = self
            .dirty
            .iter()
            .filter(|e| e.generation > e.synced_generation)
            .map(|e| DirtyTableEntry {
                table_name: e.key().clone(),
                last_modified: e.last_modified,
                generation: e.generation,
            })
            .collect();
        entries.sort_by(|a, b| a.table_name.cmp(&b.table_name));
        Ok(entries)
    }

    async fn clear_dirty(&self, table: &str, generation: u64) -> Result<bool, StorageError> {
        match self.dirty.get_mut(table) {
            Some(mut state) if state.generation == generation => {
                state.synced_generation = generation;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn load_cursor(&self, backend_id: &str) -> Result<Option<BackendCursor>, StorageError> {
        Ok(self.cursors.get(backend_id).map(|c| c.clone()))
    }

    async fn load_cursors(&self) -> Result<Vec<BackendCursor>, StorageError> {
        let mut all: Vec<BackendCursor> = self.cursors.iter().map(|c| c.value().clone()).collect();
        all.sort_by(|a, b| a.backend_id.cmp(&b.backend_id));
        Ok(all)
    }

    async fn save_cursor(&self, cursor: &BackendCursor) -> Result<(), StorageError> {
        self.cursors.insert(cursor.backend_id.clone(), cursor.clone());
        Ok(())
    }

    async fn delete_cursor(&self, backend_id: &str) -> Result<(), StorageError> {
        self.cursors.remove(backend_id);
        Ok(())
    }

    async fn defer_change(&self, deferred: &DeferredChange) -> Result<(), StorageError> {
        let key = deferred.change.key();
        let newer = self
            .deferred
            .get(&key)
            .map_or(true, |existing| deferred.change.hlc_timestamp > existing.change.hlc_timestamp);
        if newer {
            self.deferred.insert(key, deferred.clone());
        }
        Ok(())
    }

    async fn deferred_changes(
        &self,
        after: Option<&DeferredPosition>,
        limit: usize,
    ) -> Result<Vec<DeferredChange>, StorageError> {
        let mut page: Vec<DeferredChange> = self
            .deferred
            .iter()
            .filter(|d| after.map_or(true, |after| d.position() > *after))
            .map(|d| d.value().clone())
            .collect();
        page.sort_by_key(DeferredChange::position);
        page.truncate(limit);
        Ok(page)
    }

    async fn remove_deferred(&self, key: &ChangeKey, hlc: &Hlc) -> Result<(), StorageError> {
        self.deferred.remove_if(key, |_, d| d.change.hlc_timestamp == *hlc);
        Ok(())
    }

    async fn forward_change(&self, forwarded: &ForwardedChange) -> Result<(), StorageError> {
        let mut entry = self
            .forwarded
            .entry((forwarded.backend_id.clone(), forwarded.key.clone()))
            .or_insert(forwarded.hlc);
        if forwarded.hlc > *entry {
            *entry = forwarded.hlc;
        }
        Ok(())
    }

    async fn forwarded_changes(&self, backend_id: &str) -> Result<Vec<ForwardedChange>, StorageError> {
        let mut queued: Vec<ForwardedChange> = self
            .forwarded
            .iter()
            .filter(|e| e.key().0 == backend_id)
            .map(|e| ForwardedChange {
                backend_id: e.key().0.clone(),
                key: e.key().1.clone(),
                hlc: *e.value(),
            })
            .collect();
        queued.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(queued)
    }

    async fn remove_forwarded(&self, forwarded: &ForwardedChange) -> Result<(), StorageError> {
        self.forwarded
            .remove_if(&(forwarded.backend_id.clone(), forwarded.key.clone()), |_, hlc| *hlc == forwarded.hlc);
        Ok(())
    }

    async fn forwarded_backends(&self, table: &str, row_pk: &str) -> Result<Vec<String>, StorageError> {
        let mut backends: Vec<String> = self
            .forwarded
            .iter()
            .filter(|e| e.key().1.table == table && e.key().1.row_pk == row_pk)
            .map(|e| e.key().0.clone())
            .collect();
        backends.sort();
        backends.dedup();
        Ok(backends)
    }

    async fn clear_forwarded(&self, backend_id: &str) -> Result<(), StorageError> {
        self.forwarded.retain(|(backend, _), _| backend != backend_id);
        Ok(())
    }

    async fn get_meta(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.meta.get(key).map(|v| v.clone()))
    }

    async fn set_meta(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.meta.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::ColumnChange;
    use serde_json::json;
    use std::sync::Arc;

    fn hlc(physical_ms: u64) -> Hlc {
        Hlc::new(physical_ms, 0, Uuid::from_u128(1))
    }

    fn row_at(physical_ms: u64) -> Row {
        let mut row = Row::new(Uuid::new_v4());
        row.apply_column("title", json!(format!("t{physical_ms}")), hlc(physical_ms)).unwrap();
        row
    }

    fn store() -> InMemoryStore {
        let store = InMemoryStore::new();
        store.create_table("notes", &["title", "body"]);
        store
    }

    #[tokio::test]
    async fn test_new_store_has_no_tables() {
        let store = InMemoryStore::new();
        assert!(store.replicated_tables().await.unwrap().is_empty());
        assert_eq!(store.table_columns("notes").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_create_table_implies_tombstone() {
        let store = store();
        let columns = store.table_columns("notes").await.unwrap().unwrap();
        assert_eq!(columns, vec!["title", "body", TOMBSTONE_COLUMN]);
    }

    #[tokio::test]
    async fn test_put_and_get() {
        let store = store();
        let row = row_at(5);
        store.put_row("notes", &row).await.unwrap();
        assert_eq!(store.get_row("notes", row.id).await.unwrap(), Some(row));
    }

    #[tokio::test]
    async fn test_put_into_unknown_table_fails() {
        let store = store();
        let err = store.put_row("missing", &row_at(1)).await.unwrap_err();
        assert!(matches!(err, StorageError::Schema(_)));
    }

    #[tokio::test]
    async fn test_scan_is_filtered_ordered_and_paged() {
        let store = store();
        for ms in [30, 10, 20, 40] {
            store.put_row("notes", &row_at(ms)).await.unwrap();
        }

        let page = store
            .scan_rows("notes", &ScanQuery { since: Some(hlc(10)), after: None, limit: 2 })
            .await
            .unwrap();
        let stamps: Vec<u64> = page.iter().map(|r| r.row_timestamp.unwrap().physical_ms).collect();
        assert_eq!(stamps, vec![20, 30]);

        let last = page.last().unwrap();
        let next = store
            .scan_rows(
                "notes",
                &ScanQuery {
                    since: Some(hlc(10)),
                    after: Some((last.row_timestamp.unwrap(), last.id)),
                    limit: 2,
                },
            )
            .await
            .unwrap();
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].row_timestamp, Some(hlc(40)));
    }

    #[tokio::test]
    async fn test_dirty_generation_and_conditional_clear() {
        let store = store();
        store.put_row("notes", &row_at(1)).await.unwrap();
        store.put_row("notes", &row_at(2)).await.unwrap();

        let entries = store.dirty_tables().await.unwrap();
        assert_eq!(entries[0].generation, 2);

        assert!(!store.clear_dirty("notes", 1).await.unwrap());
        assert!(store.clear_dirty("notes", 2).await.unwrap());
        assert!(store.dirty_tables().await.unwrap().is_empty());

        store.put_row("notes", &row_at(3)).await.unwrap();
        assert_eq!(store.dirty_tables().await.unwrap()[0].generation, 3);
    }

    #[tokio::test]
    async fn test_purge_and_tombstone_listing() {
        let store = store();
        let mut dead = row_at(1);
        dead.apply_column(TOMBSTONE_COLUMN, json!(true), hlc(2)).unwrap();
        store.put_row("notes", &dead).await.unwrap();
        store.put_row("notes", &row_at(3)).await.unwrap();

        let tombstoned = store.tombstoned_rows("notes", None, 10).await.unwrap();
        assert_eq!(tombstoned.len(), 1);
        assert!(store.purge_row("notes", dead.id).await.unwrap());
        assert!(!store.purge_row("notes", dead.id).await.unwrap());
        assert_eq!(store.row_count("notes"), 1);
    }

    #[tokio::test]
    async fn test_deferred_keeps_highest_stamp_per_cell() {
        let store = store();
        let change = |physical_ms| DeferredChange {
            change: ColumnChange {
                table: "notes".into(),
                row_pk: "r".into(),
                column_name: "later".into(),
                hlc_timestamp: hlc(physical_ms),
                device_id: Uuid::from_u128(1),
                encrypted_value: String::new(),
                nonce: String::new(),
                batch_id: "b".into(),
                batch_seq: 0,
                batch_total: 1,
            },
            backend_id: "relay".into(),
            server_timestamp: physical_ms as i64,
            reason: "unknown column".into(),
        };

        store.defer_change(&change(5)).await.unwrap();
        store.defer_change(&change(3)).await.unwrap();
        let parked = store.deferred_changes(None, 10).await.unwrap();
        assert_eq!(parked.len(), 1);
        assert_eq!(parked[0].change.hlc_timestamp, hlc(5));

        store.remove_deferred(&parked[0].change.key(), &hlc(4)).await.unwrap();
        assert_eq!(store.deferred_len(), 1);
        store.remove_deferred(&parked[0].change.key(), &hlc(5)).await.unwrap();
        assert_eq!(store.deferred_len(), 0);
    }

    #[tokio::test]
    async fn test_deferred_pages_resume_after_position() {
        let store = store();
        for (n, column) in ["a", "b", "c", "d", "e"].into_iter().enumerate() {
            let change = ColumnChange {
                table: "notes".into(),
                row_pk: "r".into(),
                column_name: column.into(),
                hlc_timestamp: hlc(1),
                device_id: Uuid::from_u128(1),
                encrypted_value: String::new(),
                nonce: String::new(),
                batch_id: "b".into(),
                batch_seq: 0,
                batch_total: 1,
            };
            let deferred = DeferredChange {
                change,
                backend_id: "relay".into(),
                server_timestamp: (n / 2) as i64,
                reason: "unknown column".into(),
            };
            store.defer_change(&deferred).await.unwrap();
        }

        let first = store.deferred_changes(None, 2).await.unwrap();
        let after = first.last().unwrap().position();
        let second = store.deferred_changes(Some(&after), 2).await.unwrap();
        let third = store.deferred_changes(Some(&second[1].position()), 2).await.unwrap();

        let columns: Vec<&str> = first
            .iter()
            .chain(&second)
            .chain(&third)
            .map(|d| d.change.column_name.as_str())
            .collect();
        assert_eq!(columns, vec!["a", "b", "c", "d", "e"]);
    }

    #[tokio::test]
    async fn test_forwarded_keeps_highest_stamp_and_conditional_remove() {
        let store = store();
        let key = ChangeKey { table: "notes".into(), row_pk: "r".into(), column_name: "title".into() };
        let queued = |backend: &str, physical_ms| ForwardedChange {
            backend_id: backend.into(),
            key: key.clone(),
            hlc: hlc(physical_ms),
        };

        store.forward_change(&queued("two", 5)).await.unwrap();
        store.forward_change(&queued("two", 3)).await.unwrap();
        store.forward_change(&queued("three", 4)).await.unwrap();

        let for_two = store.forwarded_changes("two").await.unwrap();
        assert_eq!(for_two, vec![queued("two", 5)]);
        assert_eq!(store.forwarded_backends("notes", "r").await.unwrap(), vec!["three", "two"]);

        store.remove_forwarded(&queued("two", 3)).await.unwrap();
        assert_eq!(store.forwarded_len(), 2);
        store.remove_forwarded(&queued("two", 5)).await.unwrap();
        store.clear_forwarded("three").await.unwrap();
        assert!(store.forwarded_backends("notes", "r").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_access() {
        let store = Arc::new(store());
        let mut handles = vec![];

        for _ in 0..10 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                for ms in 0..10 {
                    store.put_row("notes", &row_at(ms + 1)).await.unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(store.row_count("notes"), 100);
        assert_eq!(store.dirty_tables().await.unwrap()[0].generation, 100);
    }
}
