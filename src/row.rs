// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replicated row model and the per-column last-writer-wins merge.
//!
//! A replicated table has exactly one UUID primary key (`id`) plus three
//! bookkeeping columns:
//!
//! | column          | meaning                                         |
//! |-----------------|-------------------------------------------------|
//! | `row_timestamp` | max of all column stamps, used as scan index    |
//! | `column_hlcs`   | column name → stamp of its last write           |
//! | `tombstone`     | soft-delete flag, replicated like any column    |
//!
//! Every write goes through [`Row::apply_column`], which keeps
//! `row_timestamp == max(column_hlcs)` after each individual column.

use crate::hlc::Hlc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;
use uuid::Uuid;

/// Primary key column.
pub const PRIMARY_KEY_COLUMN: &str = "id";
/// Row-level stamp index column.
pub const ROW_TIMESTAMP_COLUMN: &str = "row_timestamp";
/// Per-column stamp map column.
pub const COLUMN_HLCS_COLUMN: &str = "column_hlcs";
/// Soft-delete flag column.
pub const TOMBSTONE_COLUMN: &str = "tombstone";

/// Columns the application may not write directly.
pub const RESERVED_COLUMNS: [&str; 3] = [PRIMARY_KEY_COLUMN, ROW_TIMESTAMP_COLUMN, COLUMN_HLCS_COLUMN];

/// True for columns carried over the wire (data columns and the tombstone).
#[must_use]
pub fn is_replicated_column(name: &str) -> bool {
    !RESERVED_COLUMNS.contains(&name)
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RowError {
    #[error("column '{0}' is managed by the replication layer")]
    Reserved(String),
    #[error("tombstone value must be a boolean, got {0}")]
    InvalidTombstone(String),
}

/// A row of a replicated table with its replication metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub id: Uuid,
    /// Data column values (never includes `id` or the bookkeeping columns)
    pub values: BTreeMap<String, Value>,
    /// Stamp of the last write per replicated column, tombstone included
    pub column_hlcs: BTreeMap<String, Hlc>,
    /// Max of `column_hlcs`; `None` only before the first write
    pub row_timestamp: Option<Hlc>,
    pub tombstone: bool,
}

impl Row {
    #[must_use]
    pub fn new(id: Uuid) -> Self {
        Self {
            id,
            values: BTreeMap::new(),
            column_hlcs: BTreeMap::new(),
            row_timestamp: None,
            tombstone: false,
        }
    }

    /// Current value of a replicated column (the tombstone reads as a boolean).
    #[must_use]
    pub fn value(&self, column: &str) -> Option<Value> {
        if column == TOMBSTONE_COLUMN {
            return Some(Value::Bool(self.tombstone));
        }
        self.values.get(column).cloned()
    }

    #[must_use]
    pub fn column_hlc(&self, column: &str) -> Option<&Hlc> {
        self.column_hlcs.get(column)
    }

    /// Merge one column write under last-writer-wins.
    ///
    /// The write lands only if `hlc` is strictly greater than the stored stamp,
    /// so replaying the same change is a no-op. Returns whether it landed.
    pub fn apply_column(&mut self, column: &str, value: Value, hlc: Hlc) -> Result<bool, RowError> {
        if !is_replicated_column(column) {
            return Err(RowError::Reserved(column.to_string()));
        }
        if self.column_hlcs.get(column).is_some_and(|current| *current >= hlc) {
            return Ok(false);
        }

        if column == TOMBSTONE_COLUMN {
            self.tombstone = match value {
                Value::Bool(flag) => flag,
                other => return Err(RowError::InvalidTombstone(other.to_string())),
            };
        } else {
            self.values.insert(column.to_string(), value);
        }
        self.column_hlcs.insert(column.to_string(), hlc);
        self.recompute_row_timestamp();
        Ok(true)
    }

    pub fn recompute_row_timestamp(&mut self) {
        self.row_timestamp = self.column_hlcs.values().max().copied();
    }

    /// `row_timestamp == max(column_hlcs)`.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.row_timestamp == self.column_hlcs.values().max().copied()
    }

    /// Stamp of the tombstone column, if the row was ever deleted or restored.
    #[must_use]
    pub fn tombstone_hlc(&self) -> Option<&Hlc> {
        self.column_hlcs.get(TOMBSTONE_COLUMN)
    }

    /// Whether the row reads as deleted.
    ///
    /// The tombstone only counts while it is the row's newest write: any
    /// column written with a higher stamp brings the row back. This is a
    /// function of the merged column state, so every replica agrees on it
    /// regardless of delivery order.
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.tombstone && self.row_timestamp.is_some() && self.tombstone_hlc() == self.row_timestamp.as_ref()
    }
}
