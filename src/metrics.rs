// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for replica-sync.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The host application is responsible for choosing the exporter (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `replica_sync_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `backend`: relay backend id
//! - `table`: replicated table name
//! - `outcome`: success, error, timeout, rejected

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

// ═══════════════════════════════════════════════════════════════════════════
// PUSH
// ═══════════════════════════════════════════════════════════════════════════

/// Record column changes accepted by a relay
pub fn record_pushed(backend: &str, count: usize) {
    counter!(
        "replica_sync_changes_pushed_total",
        "backend" => backend.to_string()
    )
    .increment(count as u64);
}

/// Record column changes the relay already held at an equal or newer stamp
pub fn record_superseded(backend: &str, count: usize) {
    counter!(
        "replica_sync_changes_superseded_total",
        "backend" => backend.to_string()
    )
    .increment(count as u64);
}

/// Record size of one push transmission chunk
pub fn record_push_batch(backend: &str, records: usize, bytes: usize) {
    histogram!(
        "replica_sync_push_batch_records",
        "backend" => backend.to_string()
    )
    .record(records as f64);
    histogram!(
        "replica_sync_push_batch_bytes",
        "backend" => backend.to_string()
    )
    .record(bytes as f64);
}

// ═══════════════════════════════════════════════════════════════════════════
// PULL
// ═══════════════════════════════════════════════════════════════════════════

/// Record one pulled page
pub fn record_pull_page(backend: &str, changes: usize) {
    counter!(
        "replica_sync_pull_pages_total",
        "backend" => backend.to_string()
    )
    .increment(1);
    histogram!(
        "replica_sync_pull_page_changes",
        "backend" => backend.to_string()
    )
    .record(changes as f64);
}

/// Record remote column changes that won LWW and were written locally
pub fn record_applied(table: &str, count: usize) {
    counter!(
        "replica_sync_changes_applied_total",
        "table" => table.to_string()
    )
    .increment(count as u64);
}

/// Record remote column changes that lost LWW (local stamp equal or newer)
pub fn record_stale(table: &str, count: usize) {
    counter!(
        "replica_sync_changes_stale_total",
        "table" => table.to_string()
    )
    .increment(count as u64);
}

/// Record a change parked because the local schema does not know its target
pub fn record_deferred(table: &str) {
    counter!(
        "replica_sync_changes_deferred_total",
        "table" => table.to_string()
    )
    .increment(1);
}

/// Record merged cells queued for a relay whose push cursor had passed them
pub fn record_forwarded(table: &str, count: usize) {
    counter!(
        "replica_sync_changes_forwarded_total",
        "table" => table.to_string()
    )
    .increment(count as u64);
}

/// Record a malformed remote record that was skipped
pub fn record_malformed(backend: &str, reason: &str) {
    counter!(
        "replica_sync_changes_malformed_total",
        "backend" => backend.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// CYCLES - Per-backend sync cycle outcomes
// ═══════════════════════════════════════════════════════════════════════════

/// Record a completed (or failed) sync cycle
pub fn record_cycle(backend: &str, outcome: &str, duration: Duration) {
    counter!(
        "replica_sync_cycles_total",
        "backend" => backend.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
    histogram!(
        "replica_sync_cycle_seconds",
        "backend" => backend.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record a cycle abandoned on timeout
pub fn record_timeout(backend: &str) {
    counter!(
        "replica_sync_timeouts_total",
        "backend" => backend.to_string()
    )
    .increment(1);
}

/// Set number of tables awaiting confirmation on every enabled backend
pub fn set_dirty_tables(count: usize) {
    gauge!("replica_sync_dirty_tables").set(count as f64);
}

/// Set number of registered, enabled backends
pub fn set_enabled_backends(count: usize) {
    gauge!("replica_sync_enabled_backends").set(count as f64);
}

// ═══════════════════════════════════════════════════════════════════════════
// CLOCK
// ═══════════════════════════════════════════════════════════════════════════

/// Record the wall clock moving backwards under the HLC
pub fn record_clock_regression() {
    counter!("replica_sync_clock_regressions_total").increment(1);
}

/// Record a remote stamp beyond the tolerated skew
pub fn record_clock_skew() {
    counter!("replica_sync_clock_skew_total").increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// TOMBSTONES
// ═══════════════════════════════════════════════════════════════════════════

/// Record tombstoned rows physically purged
pub fn record_tombstones_purged(table: &str, count: usize) {
    counter!(
        "replica_sync_tombstones_purged_total",
        "table" => table.to_string()
    )
    .increment(count as u64);
}

// ═══════════════════════════════════════════════════════════════════════════
// RESILIENCE
// ═══════════════════════════════════════════════════════════════════════════

/// Record circuit breaker call outcome
pub fn record_circuit_breaker_call(circuit: &str, outcome: &str) {
    counter!(
        "replica_sync_circuit_breaker_calls_total",
        "circuit" => circuit.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// ENGINE STATE
// ═══════════════════════════════════════════════════════════════════════════

/// Set current engine state (for monitoring state machine)
pub fn set_engine_state(state: &str) {
    gauge!(
        "replica_sync_engine_state",
        "state" => state.to_string()
    )
    .set(1.0);
}

/// Record storage operation latency
pub fn record_store_latency(operation: &str, duration: Duration) {
    histogram!(
        "replica_sync_store_seconds",
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// A timing guard that records store latency on drop
pub struct LatencyTimer {
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    /// Start a new latency timer
    #[must_use]
    pub fn new(operation: &'static str) -> Self {
        Self { operation, start: Instant::now() }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_store_latency(self.operation, self.start.elapsed());
    }
}
