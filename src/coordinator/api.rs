// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Application-facing API: local writes, backend management, status.
//!
//! Local writes never touch the network. Each written column is stamped with
//! its own `clock.now()` under the commit gate and the row lock, then stored;
//! the store's dirty hook makes the table a push candidate.

use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::backend::RelayBackend;
use crate::error::SyncError;
use crate::resilience::circuit_breaker::{CircuitBreaker, CircuitConfig};
use crate::row::{Row, RESERVED_COLUMNS, TOMBSTONE_COLUMN};

use super::{BackendSlot, BackendStatus, SyncEngine, SyncStatus};

impl SyncEngine {
    // ═══════════════════════════════════════════════════════════════════════════
    // API: Local writes
    // ═══════════════════════════════════════════════════════════════════════════

    /// Insert a new row and return its generated id.
    ///
    /// The row's tombstone is written as `false` alongside the values, so even
    /// a row with no data columns replicates.
    pub async fn insert<I, K>(&self, table: &str, values: I) -> Result<Uuid, SyncError>
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        let mut columns = self.validate_columns(table, values).await?;
        columns.insert(TOMBSTONE_COLUMN.to_string(), Value::Bool(false));
        let id = Uuid::new_v4();
        self.write_columns(table, id, columns, false).await?;
        debug!(table = %table, row = %id, "Row inserted");
        Ok(id)
    }

    /// Update columns of an existing row.
    ///
    /// Updating a deleted row brings it back, the same way a remote edit
    /// stamped after the delete does.
    pub async fn update<I, K>(&self, table: &str, id: Uuid, values: I) -> Result<(), SyncError>
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        let columns = self.validate_columns(table, values).await?;
        self.write_columns(table, id, columns, true).await
    }

    /// Soft-delete a row (`tombstone = true`).
    pub async fn delete(&self, table: &str, id: Uuid) -> Result<(), SyncError> {
        self.set_tombstone(table, id, true).await
    }

    /// Undo a soft delete (`tombstone = false`).
    pub async fn restore(&self, table: &str, id: Uuid) -> Result<(), SyncError> {
        self.set_tombstone(table, id, false).await
    }

    /// Read a row, deleted or not; see [`Row::is_deleted`].
    pub async fn get(&self, table: &str, id: Uuid) -> Result<Option<Row>, SyncError> {
        if self.store.table_columns(table).await?.is_none() {
            return Err(SyncError::UnknownTable(table.to_string()));
        }
        Ok(self.store.get_row(table, id).await?)
    }

    async fn set_tombstone(&self, table: &str, id: Uuid, tombstone: bool) -> Result<(), SyncError> {
        if self.store.table_columns(table).await?.is_none() {
            return Err(SyncError::UnknownTable(table.to_string()));
        }
        let columns = BTreeMap::from([(TOMBSTONE_COLUMN.to_string(), Value::Bool(tombstone))]);
        self.write_columns(table, id, columns, true).await?;
        debug!(table = %table, row = %id, tombstone, "Tombstone written");
        Ok(())
    }

    async fn validate_columns<I, K>(&self, table: &str, values: I) -> Result<BTreeMap<String, Value>, SyncError>
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        let known = self
            .store
            .table_columns(table)
            .await?
            .ok_or_else(|| SyncError::UnknownTable(table.to_string()))?;

        let mut columns = BTreeMap::new();
        for (column, value) in values {
            let column: String = column.into();
            if RESERVED_COLUMNS.contains(&column.as_str()) || column == TOMBSTONE_COLUMN {
                return Err(SyncError::ReservedColumn(column));
            }
            if !known.contains(&column) {
                return Err(SyncError::UnknownColumn { table: table.to_string(), column });
            }
            columns.insert(column, value);
        }
        Ok(columns)
    }

    async fn write_columns(
        &self,
        table: &str,
        id: Uuid,
        columns: BTreeMap<String, Value>,
        must_exist: bool,
    ) -> Result<(), SyncError> {
        self.ensure_open()?;
        let _commit = self.locks.commit().await;
        let _row_lock = self.locks.lock_row(table, id).await;

        let mut row = match self.store.get_row(table, id).await? {
            Some(row) => row,
            None if must_exist => {
                return Err(SyncError::RowNotFound { table: table.to_string(), id: id.to_string() })
            }
            None => Row::new(id),
        };
        for (column, value) in columns {
            let hlc = self.clock.now();
            row.apply_column(&column, value, hlc)?;
        }
        self.store.put_row(table, &row).await?;
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // API: Backend management
    // ═══════════════════════════════════════════════════════════════════════════

    /// Register a relay backend. Its first cycle runs a full scan.
    pub fn add_backend(&self, backend: Arc<dyn RelayBackend>) -> Result<(), SyncError> {
        let id = backend.id().to_string();
        let circuit = CircuitBreaker::new(id.clone(), CircuitConfig::from_engine(&self.config.read()));
        {
            let mut backends = self.backends.write();
            if backends.contains_key(&id) {
                return Err(SyncError::DuplicateBackend(id));
            }
            backends.insert(
                id.clone(),
                Arc::new(BackendSlot {
                    backend,
                    enabled: true.into(),
                    needs_full_scan: true.into(),
                    cycle_lock: tokio::sync::Mutex::new(()),
                    circuit,
                    status: parking_lot::Mutex::new(BackendStatus::new(&id, true)),
                }),
            );
        }
        self.forward.track(&id);
        crate::metrics::set_enabled_backends(self.enabled_backends().len());
        info!(backend = %id, "Backend registered");
        Ok(())
    }

    /// Unregister a backend. Its persisted cursor is kept for a later re-add.
    pub fn remove_backend(&self, backend_id: &str) -> Result<(), SyncError> {
        if self.backends.write().remove(backend_id).is_none() {
            return Err(SyncError::UnknownBackend(backend_id.to_string()));
        }
        self.dirty.forget_backend(backend_id);
        self.forward.untrack(backend_id);
        crate::metrics::set_enabled_backends(self.enabled_backends().len());
        info!(backend = %backend_id, "Backend removed");
        Ok(())
    }

    /// Enable or disable a backend.
    ///
    /// Dirty markers may be cleared and merged cells are not forwarded while
    /// a backend is disabled, so re-enabling it schedules a full scan.
    pub fn set_backend_enabled(&self, backend_id: &str, enabled: bool) -> Result<(), SyncError> {
        let slot = self.slot(backend_id)?;
        let was_enabled = slot.enabled.swap(enabled, Ordering::AcqRel);
        if enabled && !was_enabled {
            slot.needs_full_scan.store(true, Ordering::Release);
        }
        if enabled {
            self.forward.track(backend_id);
        } else {
            self.dirty.forget_backend(backend_id);
            self.forward.untrack(backend_id);
        }
        slot.status.lock().enabled = enabled;
        crate::metrics::set_enabled_backends(self.enabled_backends().len());
        info!(backend = %backend_id, enabled, "Backend enablement changed");
        Ok(())
    }

    /// Operator re-provisioning: forget the backend's cursors and resync from scratch.
    pub async fn reset_backend(&self, backend_id: &str) -> Result<(), SyncError> {
        let slot = self.slot(backend_id)?;
        let _cycle = slot.cycle_lock.lock().await;
        self.cursors.reset(backend_id).await?;
        self.store.clear_forwarded(backend_id).await?;
        self.dirty.forget_backend(backend_id);
        slot.needs_full_scan.store(true, Ordering::Release);
        {
            let mut status = slot.status.lock();
            status.last_push_hlc = None;
            status.last_pull_server_timestamp = None;
        }
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // API: Status
    // ═══════════════════════════════════════════════════════════════════════════

    /// Non-fatal sync status: per-backend health and pending dirty tables.
    pub async fn status(&self) -> Result<SyncStatus, SyncError> {
        let slots: Vec<Arc<BackendSlot>> = self.backends.read().values().cloned().collect();
        let mut backends = Vec::with_capacity(slots.len());
        for slot in slots {
            let mut status = slot.status.lock().clone();
            if let Some(cursor) = self.cursors.get(&status.backend_id).await? {
                status.last_push_hlc = cursor.last_push_hlc;
                status.last_pull_server_timestamp = cursor.last_pull_server_timestamp;
            }
            status.circuit = slot.circuit.state();
            backends.push(status);
        }

        let pending_dirty_tables = self
            .dirty
            .dirty_tables()
            .await?
            .into_iter()
            .map(|entry| entry.table_name)
            .collect();

        Ok(SyncStatus {
            device_id: self.device_id,
            state: self.state(),
            backends,
            pending_dirty_tables,
        })
    }
}
