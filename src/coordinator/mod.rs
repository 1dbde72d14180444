// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sync engine coordinator.
//!
//! The [`SyncEngine`] ties the protocol components together around one local
//! store:
//! - the application write path (stamps every column with the device clock)
//! - one pull-then-push cycle per registered relay backend
//! - tombstone garbage collection behind the slowest enabled backend
//! - the scheduler loop and hot config reload
//!
//! # Lifecycle
//!
//! ```text
//! Created → Recovering → Ready → Running → ShuttingDown
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use replica_sync::{SyncEngine, SyncEngineConfig, EngineState, InMemoryStore, InMemoryRelay, ChaChaColumnCipher};
//! use serde_json::json;
//! use std::sync::Arc;
//! use tokio::sync::watch;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), replica_sync::SyncError> {
//! let config = SyncEngineConfig::default();
//! let (_tx, rx) = watch::channel(config.clone());
//!
//! let store = Arc::new(InMemoryStore::new());
//! store.create_table("notes", &["title", "body"]);
//! let cipher = Arc::new(ChaChaColumnCipher::new(&[0u8; 32])?);
//!
//! let engine = SyncEngine::open(config, rx, store, cipher).await?;
//! assert_eq!(engine.state(), EngineState::Ready);
//!
//! engine.add_backend(Arc::new(InMemoryRelay::new("relay-a")))?;
//! let id = engine.insert("notes", [("title", json!("hello"))]).await?;
//! engine.sync_backend("relay-a").await?;
//! # let _ = id;
//! # Ok(())
//! # }
//! ```

mod types;
mod api;
mod cycle;
mod lifecycle;

pub use types::{BackendStatus, CycleReport, EngineState, SyncStatus};

use parking_lot::{Mutex as SyncMutex, RwLock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::info;
use uuid::Uuid;

use crate::backend::RelayBackend;
use crate::config::SyncEngineConfig;
use crate::crypto::ColumnCipher;
use crate::cursor::CursorStore;
use crate::dirty::DirtyTracker;
use crate::error::SyncError;
use crate::forward::ForwardRouter;
use crate::hlc::{HlcClock, SystemTimeSource, TimeSource};
use crate::locks::ReplicaLocks;
use crate::resilience::circuit_breaker::CircuitBreaker;
use crate::storage::traits::ReplicaStore;

/// Metadata key holding this replica's device id.
pub const DEVICE_ID_META_KEY: &str = "device_id";

/// One registered relay and its per-backend state.
pub(super) struct BackendSlot {
    pub(super) backend: Arc<dyn RelayBackend>,
    pub(super) enabled: AtomicBool,
    /// Next cycle scans every replicated table from the beginning
    pub(super) needs_full_scan: AtomicBool,
    /// Serializes this backend's cycles
    pub(super) cycle_lock: Mutex<()>,
    pub(super) circuit: CircuitBreaker,
    pub(super) status: SyncMutex<BackendStatus>,
}

/// Main sync engine coordinator.
///
/// The engine is `Send + Sync`; wrap it in an `Arc` to share it between the
/// application's write path and the [`run()`](Self::run) loop.
pub struct SyncEngine {
    /// Configuration (can be updated at runtime via watch channel)
    pub(super) config: RwLock<SyncEngineConfig>,

    /// Runtime config updates (Mutex for interior mutability in run loop)
    pub(super) config_rx: Mutex<watch::Receiver<SyncEngineConfig>>,

    /// Engine state (broadcast to watchers)
    pub(super) state: watch::Sender<EngineState>,

    /// Engine state receiver (for internal use)
    pub(super) state_rx: watch::Receiver<EngineState>,

    pub(super) device_id: Uuid,
    pub(super) store: Arc<dyn ReplicaStore>,
    pub(super) clock: Arc<HlcClock>,
    pub(super) cipher: Arc<dyn ColumnCipher>,
    pub(super) locks: Arc<ReplicaLocks>,
    pub(super) dirty: DirtyTracker,
    pub(super) cursors: CursorStore,
    pub(super) forward: ForwardRouter,

    /// Registered backends by id
    pub(super) backends: RwLock<BTreeMap<String, Arc<BackendSlot>>>,
}

impl SyncEngine {
    /// Open an engine over `store` using the system clock.
    pub async fn open(
        config: SyncEngineConfig,
        config_rx: watch::Receiver<SyncEngineConfig>,
        store: Arc<dyn ReplicaStore>,
        cipher: Arc<dyn ColumnCipher>,
    ) -> Result<Self, SyncError> {
        Self::open_with_time_source(config, config_rx, store, cipher, Arc::new(SystemTimeSource)).await
    }

    /// Open an engine with an explicit time source (deterministic tests, simulations).
    ///
    /// Recovery sequence:
    /// 1. Discover replicated tables
    /// 2. Resolve the device id (config, then persisted, then generated)
    /// 3. Seed the clock from every stamp this replica has persisted
    #[tracing::instrument(skip_all)]
    pub async fn open_with_time_source(
        config: SyncEngineConfig,
        config_rx: watch::Receiver<SyncEngineConfig>,
        store: Arc<dyn ReplicaStore>,
        cipher: Arc<dyn ColumnCipher>,
        time: Arc<dyn TimeSource>,
    ) -> Result<Self, SyncError> {
        let (state_tx, state_rx) = watch::channel(EngineState::Created);
        let _ = state_tx.send(EngineState::Recovering);
        crate::metrics::set_engine_state(&EngineState::Recovering.to_string());

        // ========== PHASE 1: Schema discovery ==========
        store.refresh_schema().await?;
        let tables = store.replicated_tables().await?;

        // ========== PHASE 2: Device identity ==========
        let device_id = resolve_device_id(&config, store.as_ref()).await?;

        // ========== PHASE 3: Clock recovery ==========
        let clock = Arc::new(HlcClock::new(device_id, time));
        clock.set_max_skew_ms(config.max_clock_skew_ms);
        if let Some(max) = store.max_row_timestamp().await? {
            clock.seed(&max);
        }
        let cursors = CursorStore::new(store.clone());
        for cursor in cursors.all().await? {
            if let Some(pushed) = cursor.last_push_hlc {
                clock.seed(&pushed);
            }
        }

        info!(
            device = %device_id,
            tables = tables.len(),
            clock = ?clock.last().map(|h| h.to_string()),
            "Replica recovered"
        );

        let engine = Self {
            locks: Arc::new(ReplicaLocks::new(config.row_lock_stripes)),
            dirty: DirtyTracker::new(store.clone()),
            forward: ForwardRouter::new(store.clone()),
            config: RwLock::new(config),
            config_rx: Mutex::new(config_rx),
            state: state_tx,
            state_rx,
            device_id,
            store,
            clock,
            cipher,
            cursors,
            backends: RwLock::new(BTreeMap::new()),
        };
        engine.set_state(EngineState::Ready);
        Ok(engine)
    }

    /// Get current engine state.
    #[must_use]
    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    /// Check if engine is ready to accept requests.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        matches!(self.state(), EngineState::Ready | EngineState::Running)
    }

    #[must_use]
    pub fn device_id(&self) -> Uuid {
        self.device_id
    }

    #[must_use]
    pub fn clock(&self) -> &HlcClock {
        &self.clock
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn ReplicaStore> {
        &self.store
    }

    /// Current configuration snapshot.
    #[must_use]
    pub fn config(&self) -> SyncEngineConfig {
        self.config.read().clone()
    }

    pub(super) fn set_state(&self, state: EngineState) {
        let _ = self.state.send(state);
        crate::metrics::set_engine_state(&state.to_string());
    }

    pub(super) fn ensure_open(&self) -> Result<(), SyncError> {
        if self.state() == EngineState::ShuttingDown {
            return Err(SyncError::ShuttingDown);
        }
        Ok(())
    }

    pub(super) fn slot(&self, backend_id: &str) -> Result<Arc<BackendSlot>, SyncError> {
        self.backends
            .read()
            .get(backend_id)
            .cloned()
            .ok_or_else(|| SyncError::UnknownBackend(backend_id.to_string()))
    }

    /// Ids of registered, enabled backends.
    #[must_use]
    pub fn enabled_backends(&self) -> Vec<String> {
        self.backends
            .read()
            .iter()
            .filter(|(_, slot)| slot.enabled.load(Ordering::Acquire))
            .map(|(id, _)| id.clone())
            .collect()
    }
}

async fn resolve_device_id(config: &SyncEngineConfig, store: &dyn ReplicaStore) -> Result<Uuid, SyncError> {
    if let Some(pinned) = config.device_id {
        store.set_meta(DEVICE_ID_META_KEY, &pinned.to_string()).await?;
        return Ok(pinned);
    }
    if let Some(persisted) = store.get_meta(DEVICE_ID_META_KEY).await? {
        match Uuid::parse_str(&persisted) {
            Ok(id) => return Ok(id),
            Err(e) => {
                return Err(SyncError::Storage(crate::storage::traits::StorageError::Corruption {
                    table: "sync_meta".into(),
                    id: DEVICE_ID_META_KEY.into(),
                    reason: e.to_string(),
                }))
            }
        }
    }
    let generated = Uuid::new_v4();
    store.set_meta(DEVICE_ID_META_KEY, &generated.to_string()).await?;
    info!(device = %generated, "Generated new device id");
    Ok(generated)
}
