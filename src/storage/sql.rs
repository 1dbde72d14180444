// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQLite replica store.
//!
//! Application tables become replicated by carrying the replication columns:
//!
//! ```sql
//! CREATE TABLE notes (
//!   id            TEXT PRIMARY KEY,   -- UUID, hyphenated lowercase
//!   row_timestamp TEXT,               -- max column stamp (sortable HLC string)
//!   column_hlcs   TEXT,               -- JSON object: column -> HLC string
//!   tombstone     INTEGER NOT NULL DEFAULT 0,
//!   title         TEXT,
//!   body                              -- no affinity: values keep their type
//! )
//! ```
//!
//! Discovery runs on [`SqlStore::new`] and on every
//! [`refresh_schema`](ReplicaStore::refresh_schema). For each replicated
//! table it installs `AFTER INSERT` / `AFTER UPDATE` triggers that bump the
//! table's generation in `sync_dirty_tables`, so writes made with plain SQL
//! are tracked the same way as engine writes.
//!
//! Bookkeeping lives in `sync_*` tables, which are never replicated:
//!
//! | table                   | contents                                  |
//! |-------------------------|-------------------------------------------|
//! | `sync_dirty_tables`     | per-table write and synced generations    |
//! | `sync_backend_cursors`  | one [`BackendCursor`] per relay           |
//! | `sync_deferred_changes` | pulled changes that could not be applied  |
//! | `sync_forward_changes`  | merged cells owed to another relay        |
//! | `sync_meta`             | device identity                           |
//!
//! ## Value mapping
//!
//! Column values are stored natively: JSON numbers and strings as
//! `INTEGER`/`REAL`/`TEXT`, booleans as `0`/`1`, arrays and objects as JSON
//! text. Reads map storage classes back, so a boolean reads back as a number
//! and a nested value as its JSON text.
//!
//! ## Tombstone flag
//!
//! The `tombstone` column holds the last replicated tombstone value, not the
//! derived deleted state. A row deleted and later edited keeps `tombstone = 1`
//! because a newer data column outranks the tombstone stamp; the engine then
//! reports it live through [`Row::is_deleted`]. Plain-SQL readers that need
//! the same answer should test:
//!
//! ```sql
//! tombstone <> 0 AND json_extract(column_hlcs, '$.tombstone') = row_timestamp
//! ```

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use sqlx::query::Query;
use sqlx::sqlite::{
    SqliteArguments, SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
    SqliteSynchronous,
};
use sqlx::{Row as _, Sqlite, TypeInfo, ValueRef};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use super::traits::{DeferredChange, DeferredPosition, ForwardedChange, ReplicaStore, ScanQuery, StorageError};
use crate::change::{ChangeKey, ColumnChange};
use crate::cursor::BackendCursor;
use crate::dirty::DirtyTableEntry;
use crate::hlc::Hlc;
use crate::resilience::retry::{retry, RetryConfig};
use crate::row::{Row, COLUMN_HLCS_COLUMN, PRIMARY_KEY_COLUMN, ROW_TIMESTAMP_COLUMN, TOMBSTONE_COLUMN};

type SqliteQuery<'q> = Query<'q, Sqlite, SqliteArguments<'q>>;

const BOOKKEEPING_SCHEMA: [&str; 5] = [
    r#"
    CREATE TABLE IF NOT EXISTS sync_dirty_tables (
        table_name TEXT PRIMARY KEY,
        last_modified INTEGER NOT NULL DEFAULT 0,
        generation INTEGER NOT NULL DEFAULT 0,
        synced_generation INTEGER NOT NULL DEFAULT 0
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS sync_backend_cursors (
        backend_id TEXT PRIMARY KEY,
        last_push_hlc TEXT,
        last_pull_server_timestamp INTEGER,
        updated_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS sync_deferred_changes (
        table_name TEXT NOT NULL,
        row_pk TEXT NOT NULL,
        column_name TEXT NOT NULL,
        hlc TEXT NOT NULL,
        change TEXT NOT NULL,
        backend_id TEXT NOT NULL,
        server_timestamp INTEGER NOT NULL,
        reason TEXT NOT NULL,
        PRIMARY KEY (table_name, row_pk, column_name)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS sync_forward_changes (
        backend_id TEXT NOT NULL,
        table_name TEXT NOT NULL,
        row_pk TEXT NOT NULL,
        column_name TEXT NOT NULL,
        hlc TEXT NOT NULL,
        PRIMARY KEY (backend_id, table_name, row_pk, column_name)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS sync_meta (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    )
    "#,
];

/// Epoch millis as computed inside SQLite (trigger bodies).
const SQL_NOW_MS: &str = "CAST((julianday('now') - 2440587.5) * 86400000 AS INTEGER)";

pub struct SqlStore {
    pool: SqlitePool,
    /// Replicated table → replicated columns (data columns plus tombstone)
    schema: RwLock<BTreeMap<String, Vec<String>>>,
}

impl SqlStore {
    /// Open (creating if missing) a SQLite database with startup-mode retry.
    pub async fn new(connection_string: &str) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str(connection_string)
            .map_err(|e| StorageError::Backend(format!("Invalid SQLite URL: {e}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));

        let pool = retry("sql_connect", &RetryConfig::startup(), || {
            let options = options.clone();
            async move {
                SqlitePoolOptions::new()
                    .max_connections(8)
                    .acquire_timeout(Duration::from_secs(10))
                    .idle_timeout(Duration::from_secs(300))
                    .connect_with(options)
                    .await
                    .map_err(backend)
            }
        })
        .await?;

        let store = Self { pool, schema: RwLock::new(BTreeMap::new()) };
        store.init_schema().await?;
        store.discover().await?;
        Ok(store)
    }

    /// Connection pool, for application queries and migrations.
    pub fn pool(&self) -> SqlitePool {
        self.pool.clone()
    }

    async fn init_schema(&self) -> Result<(), StorageError> {
        for statement in BOOKKEEPING_SCHEMA {
            retry("sql_init_schema", &RetryConfig::startup(), || async {
                sqlx::query(statement).execute(&self.pool).await.map_err(backend)
            })
            .await?;
        }
        Ok(())
    }

    /// Find replicated tables and install their dirty-tracking triggers.
    async fn discover(&self) -> Result<(), StorageError> {
        let names: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        let mut discovered = BTreeMap::new();
        for name in names.into_iter().filter(|n| !n.starts_with("sync_")) {
            let info = sqlx::query(&format!("PRAGMA table_info({})", quote_ident(&name)))
                .fetch_all(&self.pool)
                .await
                .map_err(backend)?;

            let mut columns = Vec::with_capacity(info.len());
            let mut id_is_key = false;
            for column in &info {
                let column_name: String = column.try_get("name").map_err(backend)?;
                let pk: i64 = column.try_get("pk").map_err(backend)?;
                if column_name == PRIMARY_KEY_COLUMN {
                    id_is_key = pk > 0;
                }
                columns.push(column_name);
            }

            let has = |marker: &str| columns.iter().any(|c| c == marker);
            if !(id_is_key && has(ROW_TIMESTAMP_COLUMN) && has(COLUMN_HLCS_COLUMN) && has(TOMBSTONE_COLUMN)) {
                continue;
            }

            self.install_tracking(&name).await?;
            let replicated: Vec<String> = columns
                .into_iter()
                .filter(|c| crate::row::is_replicated_column(c))
                .collect();
            discovered.insert(name, replicated);
        }

        let mut schema = self.schema.write();
        if schema.keys().ne(discovered.keys()) {
            info!(tables = ?discovered.keys().collect::<Vec<_>>(), "Replicated tables discovered");
        }
        *schema = discovered;
        Ok(())
    }

    async fn install_tracking(&self, table: &str) -> Result<(), StorageError> {
        let literal = quote_literal(table);
        let bump = format!(
            "INSERT OR IGNORE INTO sync_dirty_tables (table_name) VALUES ({literal}); \
             UPDATE sync_dirty_tables SET generation = generation + 1, last_modified = {SQL_NOW_MS} \
             WHERE table_name = {literal};"
        );
        let statements = [
            format!(
                "CREATE TRIGGER IF NOT EXISTS {} AFTER INSERT ON {} BEGIN {bump} END",
                quote_ident(&format!("sync_dirty_{table}_insert")),
                quote_ident(table),
            ),
            format!(
                "CREATE TRIGGER IF NOT EXISTS {} AFTER UPDATE ON {} BEGIN {bump} END",
                quote_ident(&format!("sync_dirty_{table}_update")),
                quote_ident(table),
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS {} ON {} ({ROW_TIMESTAMP_COLUMN}, {PRIMARY_KEY_COLUMN})",
                quote_ident(&format!("sync_idx_{table}_row_timestamp")),
                quote_ident(table),
            ),
        ];
        for statement in &statements {
            sqlx::query(statement).execute(&self.pool).await.map_err(backend)?;
        }
        Ok(())
    }

    fn columns_of(&self, table: &str) -> Option<Vec<String>> {
        self.schema.read().get(table).cloned()
    }

    fn decode_row(table: &str, columns: &[String], row: &SqliteRow) -> Result<Row, StorageError> {
        let raw_id: String = row.try_get(PRIMARY_KEY_COLUMN).map_err(backend)?;
        let corrupt = |reason: String| StorageError::Corruption {
            table: table.to_string(),
            id: raw_id.clone(),
            reason,
        };
        let id = Uuid::parse_str(&raw_id).map_err(|e| corrupt(e.to_string()))?;

        let column_hlcs: BTreeMap<String, Hlc> =
            match row.try_get::<Option<String>, _>(COLUMN_HLCS_COLUMN).map_err(backend)? {
                Some(json) => serde_json::from_str(&json).map_err(|e| corrupt(format!("column_hlcs: {e}")))?,
                None => BTreeMap::new(),
            };
        let row_timestamp = row
            .try_get::<Option<String>, _>(ROW_TIMESTAMP_COLUMN)
            .map_err(backend)?
            .map(|s| s.parse::<Hlc>())
            .transpose()
            .map_err(|e| corrupt(format!("row_timestamp: {e}")))?;
        let tombstone = match decode_value(row, TOMBSTONE_COLUMN).map_err(backend)? {
            Value::Null => false,
            Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
            other => return Err(corrupt(format!("tombstone: {other}"))),
        };

        let mut values = BTreeMap::new();
        for column in columns.iter().filter(|c| c.as_str() != TOMBSTONE_COLUMN) {
            let value = decode_value(row, column).map_err(backend)?;
            if !value.is_null() || column_hlcs.contains_key(column) {
                values.insert(column.clone(), value);
            }
        }

        Ok(Row { id, values, column_hlcs, row_timestamp, tombstone })
    }

    async fn fetch_rows(
        &self,
        operation: &str,
        table: &str,
        columns: &[String],
        sql: &str,
        binds: &[String],
        limit: i64,
    ) -> Result<Vec<Row>, StorageError> {
        let rows = retry(operation, &RetryConfig::query(), || async {
            let mut query = sqlx::query(sql);
            for bind in binds {
                query = query.bind(bind.as_str());
            }
            query.bind(limit).fetch_all(&self.pool).await.map_err(backend)
        })
        .await?;
        rows.iter().map(|r| Self::decode_row(table, columns, r)).collect()
    }
}

fn backend(e: sqlx::Error) -> StorageError {
    StorageError::Backend(e.to_string())
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

/// Read a column by its storage class.
fn decode_value(row: &SqliteRow, column: &str) -> Result<Value, sqlx::Error> {
    let raw = row.try_get_raw(column)?;
    if raw.is_null() {
        return Ok(Value::Null);
    }
    let class = raw.type_info().name().to_string();
    Ok(match class.as_str() {
        "INTEGER" => Value::from(row.try_get::<i64, _>(column)?),
        "REAL" => serde_json::Number::from_f64(row.try_get::<f64, _>(column)?).map_or(Value::Null, Value::Number),
        "BLOB" => Value::String(hex::encode(row.try_get::<Vec<u8>, _>(column)?)),
        _ => Value::String(row.try_get::<String, _>(column)?),
    })
}

fn bind_value<'q>(query: SqliteQuery<'q>, value: Option<&Value>) -> SqliteQuery<'q> {
    match value {
        None | Some(Value::Null) => query.bind(None::<String>),
        Some(Value::Bool(flag)) => query.bind(i64::from(*flag)),
        Some(Value::Number(n)) => match n.as_i64() {
            Some(int) => query.bind(int),
            None => query.bind(n.as_f64().unwrap_or_default()),
        },
        Some(Value::String(s)) => query.bind(s.clone()),
        Some(nested) => query.bind(nested.to_string()),
    }
}

fn decode_cursor(row: &SqliteRow) -> Result<BackendCursor, StorageError> {
    let backend_id: String = row.try_get("backend_id").map_err(backend)?;
    let last_push_hlc = row
        .try_get::<Option<String>, _>("last_push_hlc")
        .map_err(backend)?
        .map(|s| s.parse::<Hlc>())
        .transpose()
        .map_err(|e| StorageError::Corruption {
            table: "sync_backend_cursors".into(),
            id: backend_id.clone(),
            reason: e.to_string(),
        })?;
    Ok(BackendCursor {
        last_push_hlc,
        last_pull_server_timestamp: row.try_get("last_pull_server_timestamp").map_err(backend)?,
        updated_at: row.try_get("updated_at").map_err(backend)?,
        backend_id,
    })
}

#[async_trait]
impl ReplicaStore for SqlStore {
    async fn refresh_schema(&self) -> Result<(), StorageError> {
        self.discover().await
    }

    async fn replicated_tables(&self) -> Result<Vec<String>, StorageError> {
        Ok(self.schema.read().keys().cloned().collect())
    }

    async fn table_columns(&self, table: &str) -> Result<Option<Vec<String>>, StorageError> {
        Ok(self.columns_of(table))
    }

    async fn get_row(&self, table: &str, id: Uuid) -> Result<Option<Row>, StorageError> {
        let Some(columns) = self.columns_of(table) else {
            return Ok(None);
        };
        let sql = format!("SELECT * FROM {} WHERE {PRIMARY_KEY_COLUMN} = ? LIMIT ?", quote_ident(table));
        let mut rows = self.fetch_rows("sql_get_row", table, &columns, &sql, &[id.to_string()], 1).await?;
        Ok(rows.pop())
    }

    async fn put_row(&self, table: &str, row: &Row) -> Result<(), StorageError> {
        let columns = self
            .columns_of(table)
            .ok_or_else(|| StorageError::Schema(format!("unknown table '{table}'")))?;
        if let Some(unknown) = row.values.keys().find(|k| !columns.contains(k)) {
            return Err(StorageError::Schema(format!("unknown column '{table}.{unknown}'")));
        }
        let data: Vec<&String> = columns.iter().filter(|c| c.as_str() != TOMBSTONE_COLUMN).collect();

        let mut names = vec![PRIMARY_KEY_COLUMN, ROW_TIMESTAMP_COLUMN, COLUMN_HLCS_COLUMN, TOMBSTONE_COLUMN]
            .into_iter()
            .map(quote_ident)
            .collect::<Vec<_>>();
        names.extend(data.iter().map(|c| quote_ident(c)));
        let placeholders = vec!["?"; names.len()].join(", ");
        let updates = names[1..]
            .iter()
            .map(|n| format!("{n} = excluded.{n}"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({placeholders}) ON CONFLICT({PRIMARY_KEY_COLUMN}) DO UPDATE SET {updates}",
            quote_ident(table),
            names.join(", "),
        );

        let column_hlcs = serde_json::to_string(&row.column_hlcs)
            .map_err(|e| StorageError::Backend(format!("column_hlcs encoding: {e}")))?;
        let mut query = sqlx::query(&sql)
            .bind(row.id.to_string())
            .bind(row.row_timestamp.map(|h| h.to_string()))
            .bind(column_hlcs)
            .bind(i64::from(row.tombstone));
        for column in data {
            query = bind_value(query, row.values.get(column.as_str()));
        }
        query.execute(&self.pool).await.map_err(backend)?;
        debug!(table = %table, row = %row.id, "Row written");
        Ok(())
    }

    async fn scan_rows(&self, table: &str, query: &ScanQuery) -> Result<Vec<Row>, StorageError> {
        let Some(columns) = self.columns_of(table) else {
            return Ok(Vec::new());
        };
        let mut sql = format!("SELECT * FROM {} WHERE {ROW_TIMESTAMP_COLUMN} IS NOT NULL", quote_ident(table));
        let mut binds = Vec::new();
        if let Some(since) = query.since {
            sql.push_str(&format!(" AND {ROW_TIMESTAMP_COLUMN} > ?"));
            binds.push(since.to_string());
        }
        if let Some((ts, id)) = query.after {
            sql.push_str(&format!(
                " AND ({ROW_TIMESTAMP_COLUMN} > ? OR ({ROW_TIMESTAMP_COLUMN} = ? AND {PRIMARY_KEY_COLUMN} > ?))"
            ));
            binds.extend([ts.to_string(), ts.to_string(), id.to_string()]);
        }
        sql.push_str(&format!(" ORDER BY {ROW_TIMESTAMP_COLUMN}, {PRIMARY_KEY_COLUMN} LIMIT ?"));
        self.fetch_rows("sql_scan_rows", table, &columns, &sql, &binds, sql_limit(query.limit))
            .await
    }

    async fn tombstoned_rows(
        &self,
        table: &str,
        after: Option<Uuid>,
        limit: usize,
    ) -> Result<Vec<Row>, StorageError> {
        let Some(columns) = self.columns_of(table) else {
            return Ok(Vec::new());
        };
        let mut sql = format!("SELECT * FROM {} WHERE {TOMBSTONE_COLUMN} <> 0", quote_ident(table));
        let mut binds = Vec::new();
        if let Some(after) = after {
            sql.push_str(&format!(" AND {PRIMARY_KEY_COLUMN} > ?"));
            binds.push(after.to_string());
        }
        sql.push_str(&format!(" ORDER BY {PRIMARY_KEY_COLUMN} LIMIT ?"));
        self.fetch_rows("sql_tombstoned_rows", table, &columns, &sql, &binds, sql_limit(limit))
            .await
    }

    async fn purge_row(&self, table: &str, id: Uuid) -> Result<bool, StorageError> {
        if self.columns_of(table).is_none() {
            return Ok(false);
        }
        let result = sqlx::query(&format!("DELETE FROM {} WHERE {PRIMARY_KEY_COLUMN} = ?", quote_ident(table)))
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(result.rows_affected() > 0)
    }

    async fn max_row_timestamp(&self) -> Result<Option<Hlc>, StorageError> {
        let tables: Vec<String> = self.schema.read().keys().cloned().collect();
        let mut max: Option<Hlc> = None;
        for table in tables {
            let found: Option<String> = sqlx::query_scalar(&format!(
                "SELECT MAX({ROW_TIMESTAMP_COLUMN}) FROM {}",
                quote_ident(&table)
            ))
            .fetch_one(&self.pool)
            .await
            .map_err(backend)?;
            if let Some(raw) = found {
                let hlc = raw.parse::<Hlc>().map_err(|e| StorageError::Corruption {
                    table: table.clone(),
                    id: "MAX(row_timestamp)".into(),
                    reason: e.to_string(),
                })?;
                max = max.max(Some(hlc));
            }
        }
        Ok(max)
    }

    async fn dirty_tables(&self) -> Result<Vec<DirtyTableEntry>, StorageError> {
        let rows = sqlx::query(
            "SELECT table_name, last_modified, generation FROM sync_dirty_tables \
             WHERE generation > synced_generation ORDER BY table_name",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        rows.iter()
            .map(|r| -> Result<DirtyTableEntry, StorageError> {
                let generation: i64 = r.try_get("generation").map_err(backend)?;
                Ok(DirtyTableEntry {
                    table_name: r.try_get("table_name").map_err(backend)?,
                    last_modified: r.try_get("last_modified").map_err(backend)?,
                    generation: u64::try_from(generation).unwrap_or_default(),
                })
            })
            .collect()
    }

    async fn clear_dirty(&self, table: &str, generation: u64) -> Result<bool, StorageError> {
        let generation = i64::try_from(generation).unwrap_or(i64::MAX);
        let result = sqlx::query(
            "UPDATE sync_dirty_tables SET synced_generation = ? WHERE table_name = ? AND generation = ?",
        )
        .bind(generation)
        .bind(table)
        .bind(generation)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(result.rows_affected() == 1)
    }

    async fn load_cursor(&self, backend_id: &str) -> Result<Option<BackendCursor>, StorageError> {
        let row = sqlx::query("SELECT * FROM sync_backend_cursors WHERE backend_id = ?")
            .bind(backend_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        row.as_ref().map(decode_cursor).transpose()
    }

    async fn load_cursors(&self) -> Result<Vec<BackendCursor>, StorageError> {
        let rows = sqlx::query("SELECT * FROM sync_backend_cursors ORDER BY backend_id")
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        rows.iter().map(decode_cursor).collect()
    }

    async fn save_cursor(&self, cursor: &BackendCursor) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO sync_backend_cursors (backend_id, last_push_hlc, last_pull_server_timestamp, updated_at) \
             VALUES (?, ?, ?, ?) \
             ON CONFLICT(backend_id) DO UPDATE SET last_push_hlc = excluded.last_push_hlc, \
             last_pull_server_timestamp = excluded.last_pull_server_timestamp, updated_at = excluded.updated_at",
        )
        .bind(&cursor.backend_id)
        .bind(cursor.last_push_hlc.map(|h| h.to_string()))
        .bind(cursor.last_pull_server_timestamp)
        .bind(cursor.updated_at)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn delete_cursor(&self, backend_id: &str) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM sync_backend_cursors WHERE backend_id = ?")
            .bind(backend_id)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn defer_change(&self, deferred: &DeferredChange) -> Result<(), StorageError> {
        let change = &deferred.change;
        let encoded = serde_json::to_string(change)
            .map_err(|e| StorageError::Backend(format!("deferred change encoding: {e}")))?;
        sqlx::query(
            "INSERT INTO sync_deferred_changes \
             (table_name, row_pk, column_name, hlc, change, backend_id, server_timestamp, reason) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(table_name, row_pk, column_name) DO UPDATE SET \
             hlc = excluded.hlc, change = excluded.change, backend_id = excluded.backend_id, \
             server_timestamp = excluded.server_timestamp, reason = excluded.reason \
             WHERE excluded.hlc > sync_deferred_changes.hlc",
        )
        .bind(&change.table)
        .bind(&change.row_pk)
        .bind(&change.column_name)
        .bind(change.hlc_timestamp.to_string())
        .bind(encoded)
        .bind(&deferred.backend_id)
        .bind(deferred.server_timestamp)
        .bind(&deferred.reason)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn deferred_changes(
        &self,
        after: Option<&DeferredPosition>,
        limit: usize,
    ) -> Result<Vec<DeferredChange>, StorageError> {
        let query = match after {
            Some(after) => sqlx::query(
                "SELECT change, backend_id, server_timestamp, reason FROM sync_deferred_changes \
                 WHERE (server_timestamp, table_name, row_pk, column_name) > (?, ?, ?, ?) \
                 ORDER BY server_timestamp, table_name, row_pk, column_name LIMIT ?",
            )
            .bind(after.server_timestamp)
            .bind(after.key.table.clone())
            .bind(after.key.row_pk.clone())
            .bind(after.key.column_name.clone()),
            None => sqlx::query(
                "SELECT change, backend_id, server_timestamp, reason FROM sync_deferred_changes \
                 ORDER BY server_timestamp, table_name, row_pk, column_name LIMIT ?",
            ),
        };
        let rows = query
            .bind(sql_limit(limit))
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;

        rows.iter()
            .map(|r| -> Result<DeferredChange, StorageError> {
                let encoded: String = r.try_get("change").map_err(backend)?;
                let change: ColumnChange =
                    serde_json::from_str(&encoded).map_err(|e| StorageError::Corruption {
                        table: "sync_deferred_changes".into(),
                        id: "change".into(),
                        reason: e.to_string(),
                    })?;
                Ok(DeferredChange {
                    change,
                    backend_id: r.try_get("backend_id").map_err(backend)?,
                    server_timestamp: r.try_get("server_timestamp").map_err(backend)?,
                    reason: r.try_get("reason").map_err(backend)?,
                })
            })
            .collect()
    }

    async fn remove_deferred(&self, key: &ChangeKey, hlc: &Hlc) -> Result<(), StorageError> {
        sqlx::query(
            "DELETE FROM sync_deferred_changes \
             WHERE table_name = ? AND row_pk = ? AND column_name = ? AND hlc = ?",
        )
        .bind(&key.table)
        .bind(&key.row_pk)
        .bind(&key.column_name)
        .bind(hlc.to_string())
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn forward_change(&self, forwarded: &ForwardedChange) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO sync_forward_changes (backend_id, table_name, row_pk, column_name, hlc) \
             VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT(backend_id, table_name, row_pk, column_name) DO UPDATE SET hlc = excluded.hlc \
             WHERE excluded.hlc > sync_forward_changes.hlc",
        )
        .bind(&forwarded.backend_id)
        .bind(&forwarded.key.table)
        .bind(&forwarded.key.row_pk)
        .bind(&forwarded.key.column_name)
        .bind(forwarded.hlc.to_string())
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn forwarded_changes(&self, backend_id: &str) -> Result<Vec<ForwardedChange>, StorageError> {
        let rows = sqlx::query(
            "SELECT table_name, row_pk, column_name, hlc FROM sync_forward_changes \
             WHERE backend_id = ? ORDER BY table_name, row_pk, column_name",
        )
        .bind(backend_id)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        rows.iter()
            .map(|r| -> Result<ForwardedChange, StorageError> {
                let stamp: String = r.try_get("hlc").map_err(backend)?;
                let hlc = stamp.parse::<Hlc>().map_err(|e| StorageError::Corruption {
                    table: "sync_forward_changes".into(),
                    id: stamp.clone(),
                    reason: e.to_string(),
                })?;
                Ok(ForwardedChange {
                    backend_id: backend_id.to_string(),
                    key: ChangeKey {
                        table: r.try_get("table_name").map_err(backend)?,
                        row_pk: r.try_get("row_pk").map_err(backend)?,
                        column_name: r.try_get("column_name").map_err(backend)?,
                    },
                    hlc,
                })
            })
            .collect()
    }

    async fn remove_forwarded(&self, forwarded: &ForwardedChange) -> Result<(), StorageError> {
        sqlx::query(
            "DELETE FROM sync_forward_changes \
             WHERE backend_id = ? AND table_name = ? AND row_pk = ? AND column_name = ? AND hlc = ?",
        )
        .bind(&forwarded.backend_id)
        .bind(&forwarded.key.table)
        .bind(&forwarded.key.row_pk)
        .bind(&forwarded.key.column_name)
        .bind(forwarded.hlc.to_string())
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn forwarded_backends(&self, table: &str, row_pk: &str) -> Result<Vec<String>, StorageError> {
        sqlx::query_scalar(
            "SELECT DISTINCT backend_id FROM sync_forward_changes \
             WHERE table_name = ? AND row_pk = ? ORDER BY backend_id",
        )
        .bind(table)
        .bind(row_pk)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)
    }

    async fn clear_forwarded(&self, backend_id: &str) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM sync_forward_changes WHERE backend_id = ?")
            .bind(backend_id)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn get_meta(&self, key: &str) -> Result<Option<String>, StorageError> {
        sqlx::query_scalar("SELECT value FROM sync_meta WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)
    }

    async fn set_meta(&self, key: &str, value: &str) -> Result<(), StorageError> {
        sqlx::query("INSERT INTO sync_meta (key, value) VALUES (?, ?) ON CONFLICT(key) DO UPDATE SET value = excluded.value")
            .bind(key)
            .bind(value)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }
}
