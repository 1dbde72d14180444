// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Public types for the sync engine coordinator.

use uuid::Uuid;

use crate::hlc::Hlc;
use crate::pull::{DeferredReport, PullReport};
use crate::push::PushReport;
use crate::resilience::circuit_breaker::CircuitState;

/// Engine lifecycle state.
///
/// Use [`super::SyncEngine::state()`] to check the current state or
/// [`super::SyncEngine::state_receiver()`] to watch for changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Just created, not yet opened
    Created,
    /// Resolving device identity, discovering schema, seeding the clock
    Recovering,
    /// Accepting writes and manual sync calls
    Ready,
    /// Scheduler loop active
    Running,
    /// Graceful shutdown in progress
    ShuttingDown,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Recovering => write!(f, "Recovering"),
            Self::Ready => write!(f, "Ready"),
            Self::Running => write!(f, "Running"),
            Self::ShuttingDown => write!(f, "ShuttingDown"),
        }
    }
}

/// Health of one registered backend, as of its last cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendStatus {
    pub backend_id: String,
    pub enabled: bool,
    /// Epoch millis of the last successful cycle
    pub last_success_at: Option<i64>,
    pub last_error: Option<String>,
    pub last_push_hlc: Option<Hlc>,
    pub last_pull_server_timestamp: Option<i64>,
    pub consecutive_failures: u32,
    pub circuit: CircuitState,
}

impl BackendStatus {
    pub(super) fn new(backend_id: &str, enabled: bool) -> Self {
        Self {
            backend_id: backend_id.to_string(),
            enabled,
            last_success_at: None,
            last_error: None,
            last_push_hlc: None,
            last_pull_server_timestamp: None,
            consecutive_failures: 0,
            circuit: CircuitState::Closed,
        }
    }
}

/// Snapshot returned by [`super::SyncEngine::status()`].
///
/// Sync failures never block the local replica; this is how they surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncStatus {
    pub device_id: Uuid,
    pub state: EngineState,
    pub backends: Vec<BackendStatus>,
    /// Tables with writes not yet confirmed on every enabled backend
    pub pending_dirty_tables: Vec<String>,
}

/// Result of one pull-then-push cycle against one backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub backend_id: String,
    pub pull: PullReport,
    pub deferred: DeferredReport,
    pub push: PushReport,
    /// Tables scanned for the push phase
    pub tables_scanned: usize,
    /// Whether the push phase scanned every replicated table
    pub full_scan: bool,
    /// Tables whose dirty marker was cleared after this cycle
    pub tables_cleared: usize,
}
