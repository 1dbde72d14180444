// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Column-level change detection.
//!
//! There is no change log. The row is the source of truth: `row_timestamp`
//! rules out unchanged rows through the store's index, then `column_hlcs`
//! says exactly which columns a backend has not seen.
//!
//! ```text
//! rows where row_timestamp > cursor        (index range, keyset paged)
//!   └─► columns where cursor < hlc <= ceiling
//!         └─► ChangeCandidate
//! ```
//!
//! The ceiling is the clock high-water mark read under the commit gate.
//! Stamps above it belong to writes that may still be in flight and are left
//! for the next cycle; the row filter itself has no upper bound, so a row
//! touched again after the ceiling still surfaces its older columns.

use std::sync::Arc;
use tracing::debug;

use crate::change::ChangeCandidate;
use crate::hlc::Hlc;
use crate::row::{is_replicated_column, Row};
use crate::storage::traits::{ReplicaStore, ScanQuery, StorageError};

/// Columns of `row` stamped in `(cursor, ceiling]`.
pub fn column_changes<'a>(
    table: &'a str,
    row: &'a Row,
    cursor: Option<&'a Hlc>,
    ceiling: &'a Hlc,
) -> impl Iterator<Item = ChangeCandidate> + 'a {
    row.column_hlcs
        .iter()
        .filter(move |(column, hlc)| {
            is_replicated_column(column) && cursor.map_or(true, |c| *hlc > c) && *hlc <= ceiling
        })
        .map(move |(column, hlc)| ChangeCandidate {
            table: table.to_string(),
            row_id: row.id,
            column: column.clone(),
            hlc: *hlc,
            value: row.value(column).unwrap_or(serde_json::Value::Null),
        })
}

pub struct Scanner {
    store: Arc<dyn ReplicaStore>,
    page_size: usize,
}

impl Scanner {
    pub fn new(store: Arc<dyn ReplicaStore>, page_size: usize) -> Self {
        Self { store, page_size: page_size.max(1) }
    }

    /// Every column change in `table` a backend at `cursor` has not received.
    ///
    /// `cursor == None` is the full-sync case.
    pub async fn scan_table(
        &self,
        table: &str,
        cursor: Option<Hlc>,
        ceiling: &Hlc,
    ) -> Result<Vec<ChangeCandidate>, StorageError> {
        let mut candidates = Vec::new();
        let mut after: Option<(Hlc, uuid::Uuid)> = None;
        let mut rows_seen = 0usize;

        loop {
            let query = ScanQuery { since: cursor, after, limit: self.page_size };
            let rows = self.store.scan_rows(table, &query).await?;
            let page_len = rows.len();
            rows_seen += page_len;

            for row in &rows {
                candidates.extend(column_changes(table, row, cursor.as_ref(), ceiling));
            }

            match rows.last().and_then(|row| row.row_timestamp.map(|ts| (ts, row.id))) {
                Some(position) if page_len >= self.page_size => after = Some(position),
                _ => break,
            }
        }

        debug!(
            table = %table,
            cursor = ?cursor.map(|c| c.to_string()),
            rows = rows_seen,
            changes = candidates.len(),
            "Table scanned"
        );
        Ok(candidates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::InMemoryStore;
    use serde_json::json;
    use uuid::Uuid;

    fn hlc(physical_ms: u64) -> Hlc {
        Hlc::new(physical_ms, 0, Uuid::nil())
    }

    fn row_with(columns: &[(&str, u64)]) -> Row {
        let mut row = Row::new(Uuid::new_v4());
        for (column, at) in columns {
            let value = if *column == "tombstone" { json!(true) } else { json!(format!("{column}@{at}")) };
            row.apply_column(column, value, hlc(*at)).unwrap();
        }
        row
    }

    #[test]
    fn test_emits_only_columns_in_window() {
        let row = row_with(&[("a", 10), ("b", 20), ("c", 30)]);
        let cursor = hlc(10);
        let ceiling = hlc(20);
        let found: Vec<_> = column_changes("t", &row, Some(&cursor), &ceiling).collect();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].column, "b");
        assert_eq!(found[0].value, json!("b@20"));
    }

    #[test]
    fn test_no_cursor_emits_everything_below_ceiling() {
        let row = row_with(&[("a", 10), ("tombstone", 20)]);
        let found: Vec<_> = column_changes("t", &row, None, &hlc(100)).collect();
        assert_eq!(found.len(), 2);
        let tombstone = found.iter().find(|c| c.column == "tombstone").unwrap();
        assert_eq!(tombstone.value, json!(true));
    }

    #[tokio::test]
    async fn test_scan_pages_through_table() {
        let store = Arc::new(InMemoryStore::new());
        store.create_table("notes", &["title"]);
        for at in 1..=7u64 {
            store.put_row("notes", &row_with(&[("title", at)])).await.unwrap();
        }

        let scanner = Scanner::new(store.clone(), 2);
        let all = scanner.scan_table("notes", None, &hlc(100)).await.unwrap();
        assert_eq!(all.len(), 7);

        let recent = scanner.scan_table("notes", Some(hlc(5)), &hlc(100)).await.unwrap();
        let mut stamps: Vec<u64> = recent.iter().map(|c| c.hlc.physical_ms).collect();
        stamps.sort_unstable();
        assert_eq!(stamps, vec![6, 7]);
    }

    #[tokio::test]
    async fn test_row_touched_after_ceiling_still_yields_older_columns() {
        let store = Arc::new(InMemoryStore::new());
        store.create_table("notes", &["title", "body"]);
        store.put_row("notes", &row_with(&[("title", 5), ("body", 50)])).await.unwrap();

        let scanner = Scanner::new(store, 10);
        let found = scanner.scan_table("notes", Some(hlc(1)), &hlc(20)).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].column, "title");
    }
}
