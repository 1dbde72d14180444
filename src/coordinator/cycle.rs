// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sync cycles and garbage collection.
//!
//! One cycle against one backend:
//!
//! ```text
//! refresh schema
//!   → pull every page (cursor persisted per page)
//!   → retry deferred changes
//!   → read dirty tables (with generations)
//!   → snapshot scan ceiling under the commit gate, open the push window
//!   → scan (cursor, ceiling], add forwarded cells, push
//!   → drop delivered forwarded cells
//!   → confirm generations, clear tables every enabled backend holds
//! ```
//!
//! The whole cycle runs under the backend's cycle lock and the configured
//! timeout. A timed-out cycle is dropped at its current await point, which
//! releases its in-flight markers and leaves cursors at their last confirmed
//! position.

use futures::future::join_all;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::batching::BatchLimits;
use crate::error::SyncError;
use crate::pull::{retry_deferred, PullPipeline, RowMerger};
use crate::push::PushPipeline;
use crate::scanner::Scanner;
use crate::tombstone::{GcReport, TombstoneManager};

use super::{BackendSlot, CycleReport, SyncEngine};

/// Page size for walking the deferred area.
const DEFERRED_PAGE_SIZE: usize = 1000;

impl SyncEngine {
    /// Run one pull-then-push cycle against `backend_id`.
    ///
    /// Waits for a cycle already running on the same backend to finish.
    #[tracing::instrument(skip(self))]
    pub async fn sync_backend(&self, backend_id: &str) -> Result<CycleReport, SyncError> {
        self.ensure_open()?;
        let slot = self.slot(backend_id)?;
        if !slot.enabled.load(Ordering::Acquire) {
            return Err(SyncError::BackendDisabled(backend_id.to_string()));
        }
        let _cycle = slot.cycle_lock.lock().await;
        self.timed_cycle(&slot).await
    }

    /// Run a cycle on every enabled backend concurrently.
    ///
    /// Backends whose previous cycle is still running are skipped.
    #[tracing::instrument(skip(self))]
    pub async fn sync_all(&self) -> Result<Vec<(String, Result<CycleReport, SyncError>)>, SyncError> {
        self.ensure_open()?;
        let slots: Vec<Arc<BackendSlot>> = self
            .backends
            .read()
            .values()
            .filter(|slot| slot.enabled.load(Ordering::Acquire))
            .cloned()
            .collect();

        let cycles = slots.iter().filter_map(|slot| {
            let backend_id = slot.backend.id().to_string();
            match slot.cycle_lock.try_lock() {
                Ok(guard) => Some(async move {
                    let result = self.timed_cycle(slot).await;
                    drop(guard);
                    (backend_id, result)
                }),
                Err(_) => {
                    debug!(backend = %backend_id, "Previous cycle still running; skipping");
                    None
                }
            }
        });
        Ok(join_all(cycles).await)
    }

    /// Purge tombstones every enabled backend has converged past.
    #[tracing::instrument(skip(self))]
    pub async fn collect_garbage(&self) -> Result<GcReport, SyncError> {
        self.ensure_open()?;
        let (retention, page_size) = {
            let config = self.config.read();
            (config.tombstone_retention(), config.scan_page_size)
        };
        let manager = TombstoneManager::new(self.store.clone(), self.locks.clone(), retention, page_size);
        manager
            .collect_garbage(&self.cursors, &self.enabled_backends(), self.clock.wall_ms())
            .await
    }

    async fn timed_cycle(&self, slot: &BackendSlot) -> Result<CycleReport, SyncError> {
        let backend_id = slot.backend.id();
        let timeout = self.config.read().cycle_timeout();
        let start = Instant::now();

        let result = match tokio::time::timeout(timeout, self.cycle(slot)).await {
            Ok(result) => result,
            Err(_) => {
                crate::metrics::record_timeout(backend_id);
                Err(SyncError::Timeout { backend: backend_id.to_string(), after: timeout })
            }
        };

        let elapsed = start.elapsed();
        let mut status = slot.status.lock();
        status.circuit = slot.circuit.state();
        match &result {
            Ok(report) => {
                crate::metrics::record_cycle(backend_id, "success", elapsed);
                status.last_success_at = Some(chrono::Utc::now().timestamp_millis());
                status.last_error = None;
                status.consecutive_failures = 0;
                status.last_push_hlc = report.push.cursor;
                status.last_pull_server_timestamp = report.pull.cursor;
            }
            Err(e) => {
                let outcome = if matches!(e, SyncError::Timeout { .. }) { "timeout" } else { "failure" };
                crate::metrics::record_cycle(backend_id, outcome, elapsed);
                status.last_error = Some(e.to_string());
                status.consecutive_failures = status.consecutive_failures.saturating_add(1);
                warn!(
                    backend = %backend_id,
                    error = %e,
                    transient = e.is_transient(),
                    failures = status.consecutive_failures,
                    "Sync cycle failed; cursors unchanged past last confirmed work"
                );
            }
        }
        result
    }

    async fn cycle(&self, slot: &BackendSlot) -> Result<CycleReport, SyncError> {
        let backend = slot.backend.as_ref();
        let backend_id = backend.id();
        let config = self.config.read().clone();

        self.store.refresh_schema().await?;
        let merger = RowMerger {
            store: self.store.as_ref(),
            clock: &self.clock,
            locks: &self.locks,
            router: Some(&self.forward),
        };

        // ========== PHASE 1: Pull ==========
        let pull = PullPipeline {
            backend,
            circuit: &slot.circuit,
            cipher: self.cipher.as_ref(),
            cursors: &self.cursors,
            merger,
            exclude_device_id: config.exclude_own_changes.then_some(self.device_id),
            page_limit: config.pull_page_limit,
        }
        .run()
        .await?;

        // ========== PHASE 2: Deferred changes ==========
        let deferred = retry_deferred(&merger, self.cipher.as_ref(), DEFERRED_PAGE_SIZE).await?;

        // ========== PHASE 3: Change detection ==========
        // Dirty generations are read before the ceiling so every write they
        // count is at or below it.
        let dirty = self.dirty.dirty_tables().await?;
        let push_cursor = self.cursors.get(backend_id).await?.and_then(|c| c.last_push_hlc);
        let full_scan = slot.needs_full_scan.load(Ordering::Acquire) || push_cursor.is_none();
        let tables: Vec<String> = if full_scan {
            self.store.replicated_tables().await?
        } else {
            dirty.iter().map(|entry| entry.table_name.clone()).collect()
        };
        let scan_from = if full_scan { None } else { push_cursor };

        let in_flight = self.dirty.begin_push(dirty.iter().map(|entry| entry.table_name.clone()));
        let (ceiling, window) = self
            .locks
            .snapshot_ceiling_with(&self.clock, |ceiling| {
                let window = ceiling.map(|c| self.forward.open_window(backend_id, c));
                (ceiling, window)
            })
            .await;

        let scanner = Scanner::new(self.store.clone(), config.scan_page_size);
        let mut candidates = Vec::new();
        if let Some(ceiling) = ceiling {
            for table in &tables {
                candidates.extend(scanner.scan_table(table, scan_from, &ceiling).await?);
            }
        }
        let forwarded = self.forward.pending(backend_id).await?;

        // ========== PHASE 4: Push ==========
        let push = PushPipeline {
            backend,
            circuit: &slot.circuit,
            cipher: self.cipher.as_ref(),
            cursors: &self.cursors,
            device_id: self.device_id,
            limits: BatchLimits {
                max_records: config.push_batch_size,
                max_bytes: config.push_batch_bytes,
            },
        }
        .run(&candidates, &forwarded.candidates)
        .await?;
        self.forward.clear(&forwarded.entries).await?;
        drop(window);
        drop(in_flight);

        if full_scan {
            slot.needs_full_scan.store(false, Ordering::Release);
        }

        // ========== PHASE 5: Dirty clearing ==========
        let enabled = self.enabled_backends();
        let mut tables_cleared = 0;
        for entry in &dirty {
            self.dirty.confirm(backend_id, &entry.table_name, entry.generation);
            if self.dirty.try_clear(&entry.table_name, &enabled).await? {
                tables_cleared += 1;
            }
        }

        info!(
            backend = %backend_id,
            pulled = pull.received,
            applied = pull.applied,
            pushed = push.accepted,
            forwarded = push.forwarded,
            superseded = push.superseded,
            tables = tables.len(),
            full_scan,
            tables_cleared,
            "Sync cycle complete"
        );

        Ok(CycleReport {
            backend_id: backend_id.to_string(),
            pull,
            deferred,
            push,
            tables_scanned: tables.len(),
            full_scan,
            tables_cleared,
        })
    }
}
