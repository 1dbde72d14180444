// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for the replication engine.
//!
//! # Example
//!
//! ```
//! use replica_sync::SyncEngineConfig;
//!
//! // Minimal config (uses defaults)
//! let config = SyncEngineConfig::default();
//! assert_eq!(config.sync_interval_ms, 30_000);
//!
//! // Tuned config
//! let config = SyncEngineConfig {
//!     sql_url: Some("sqlite:replica.db".into()),
//!     push_batch_size: 200,
//!     tombstone_retention_days: 7,
//!     ..Default::default()
//! };
//! assert!(config.exclude_own_changes);
//! ```

use serde::Deserialize;
use std::time::Duration;
use uuid::Uuid;

/// Configuration for the replication engine.
///
/// All fields have sensible defaults. Runtime changes are delivered through
/// the `watch` channel handed to [`crate::SyncEngine::open`]; intervals,
/// timeouts and batch sizes take effect on the next cycle.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncEngineConfig {
    /// SQLite connection string (e.g., "sqlite:replica.db"). In-memory store when unset.
    #[serde(default)]
    pub sql_url: Option<String>,

    /// Pin the device id instead of loading or generating one
    #[serde(default)]
    pub device_id: Option<Uuid>,

    /// Interval between scheduled sync rounds
    #[serde(default = "default_sync_interval_ms")]
    pub sync_interval_ms: u64,

    /// Upper bound on one backend's pull-then-push cycle
    #[serde(default = "default_cycle_timeout_ms")]
    pub cycle_timeout_ms: u64,

    /// Push chunking
    #[serde(default = "default_push_batch_size")]
    pub push_batch_size: usize,
    #[serde(default = "default_push_batch_bytes")]
    pub push_batch_bytes: usize,

    /// Records requested per pull page
    #[serde(default = "default_pull_page_limit")]
    pub pull_page_limit: usize,

    /// Rows read per scanner page
    #[serde(default = "default_scan_page_size")]
    pub scan_page_size: usize,

    /// Ask relays to omit this device's own changes on pull
    #[serde(default = "default_exclude_own_changes")]
    pub exclude_own_changes: bool,

    /// Tombstone retention before physical purge becomes eligible
    #[serde(default = "default_tombstone_retention_days")]
    pub tombstone_retention_days: u32,

    /// Interval between garbage collection passes (0 = disabled)
    #[serde(default = "default_gc_interval_secs")]
    pub gc_interval_secs: u64,

    /// Remote stamps further ahead of local time than this are flagged
    #[serde(default = "default_max_clock_skew_ms")]
    pub max_clock_skew_ms: u64,

    /// Stripes for per-row merge locks
    #[serde(default = "default_row_lock_stripes")]
    pub row_lock_stripes: usize,

    /// Per-backend circuit breaker: calls judged per window (trips above 50% failures)
    #[serde(default = "default_circuit_window")]
    pub circuit_window: usize,

    /// Per-backend circuit breaker: wait before probing a tripped backend
    #[serde(default = "default_circuit_recovery_ms")]
    pub circuit_recovery_ms: u64,
}

fn default_sync_interval_ms() -> u64 { 30_000 }
fn default_cycle_timeout_ms() -> u64 { 60_000 }
fn default_push_batch_size() -> usize { 500 }
fn default_push_batch_bytes() -> usize { 1024 * 1024 } // 1 MB
fn default_pull_page_limit() -> usize { 1000 }
fn default_scan_page_size() -> usize { 500 }
fn default_exclude_own_changes() -> bool { true }
fn default_tombstone_retention_days() -> u32 { 30 }
fn default_gc_interval_secs() -> u64 { 3600 }
fn default_max_clock_skew_ms() -> u64 { 5 * 60 * 1000 }
fn default_row_lock_stripes() -> usize { 64 }
fn default_circuit_window() -> usize { 10 }
fn default_circuit_recovery_ms() -> u64 { 30_000 }

impl Default for SyncEngineConfig {
    fn default() -> Self {
        Self {
            sql_url: None,
            device_id: None,
            sync_interval_ms: default_sync_interval_ms(),
            cycle_timeout_ms: default_cycle_timeout_ms(),
            push_batch_size: default_push_batch_size(),
            push_batch_bytes: default_push_batch_bytes(),
            pull_page_limit: default_pull_page_limit(),
            scan_page_size: default_scan_page_size(),
            exclude_own_changes: default_exclude_own_changes(),
            tombstone_retention_days: default_tombstone_retention_days(),
            gc_interval_secs: default_gc_interval_secs(),
            max_clock_skew_ms: default_max_clock_skew_ms(),
            row_lock_stripes: default_row_lock_stripes(),
            circuit_window: default_circuit_window(),
            circuit_recovery_ms: default_circuit_recovery_ms(),
        }
    }
}

impl SyncEngineConfig {
    #[must_use]
    pub fn cycle_timeout(&self) -> Duration {
        Duration::from_millis(self.cycle_timeout_ms)
    }

    #[must_use]
    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms.max(1))
    }

    #[must_use]
    pub fn tombstone_retention(&self) -> Duration {
        Duration::from_secs(u64::from(self.tombstone_retention_days) * 24 * 3600)
    }
}
