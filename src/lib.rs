// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # Replica Sync
//!
//! An offline-first replication engine for relational replicas spread over
//! many devices. Every replica is fully writable while offline; devices
//! converge through untrusted relays that only ever see encrypted cells.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Application writes                      │
//! │  • insert / update / delete / restore via SyncEngine        │
//! │  • every column stamped with its own HLC                    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Local replica store                      │
//! │  • rows + column_hlcs + row_timestamp + tombstone           │
//! │  • dirty-table generations bumped on every write            │
//! │  • cursors, deferred changes, device identity               │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!            (per backend: pull, then push, under a timeout)
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Relay backends                        │
//! │  • CAS per (table, rowPk, column) on the HLC                │
//! │  • ingestion-ordered pull with server timestamps            │
//! │  • circuit breaker per backend                              │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Conflicts resolve per column: the higher HLC wins on every replica and on
//! every relay, so delivery order and duplicates never change the outcome.
//! Deletes are a replicated `tombstone` column, purged once every enabled
//! backend has seen them.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use replica_sync::{ChaChaColumnCipher, InMemoryRelay, SyncEngine, SyncEngineConfig};
//! use serde_json::json;
//! use std::sync::Arc;
//! use tokio::sync::watch;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), replica_sync::SyncError> {
//!     let config = SyncEngineConfig {
//!         sql_url: Some("sqlite:replica.db".into()),
//!         ..Default::default()
//!     };
//!     let (_tx, rx) = watch::channel(config.clone());
//!
//!     let store = replica_sync::storage::connect(&config).await?;
//!     let cipher = Arc::new(ChaChaColumnCipher::new(&ChaChaColumnCipher::generate_key())?);
//!     let engine = Arc::new(SyncEngine::open(config, rx, store, cipher).await?);
//!
//!     engine.add_backend(Arc::new(InMemoryRelay::new("relay")))?;
//!
//!     let id = engine.insert("notes", [("title", json!("groceries"))]).await?;
//!     engine.update("notes", id, [("title", json!("groceries (2)"))]).await?;
//!     engine.sync_backend("relay").await?;
//!
//!     let runner = engine.clone();
//!     let loop_handle = tokio::spawn(async move { runner.run().await });
//!     engine.shutdown().await;
//!     let _ = loop_handle.await;
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration
//!
//! See [`SyncEngineConfig`] for all configuration options.
//!
//! ## Modules
//!
//! - [`coordinator`]: The [`SyncEngine`] write API, sync cycles and run loop
//! - [`hlc`]: Hybrid logical clock
//! - [`row`]: Replicated row model and per-column last-writer-wins
//! - [`storage`]: Replica stores (SQLite, memory)
//! - [`backend`]: Relay seam and the in-memory relay
//! - [`crypto`]: Per-cell authenticated encryption
//! - [`scanner`], [`push`], [`pull`]: The sync pipelines
//! - [`forward`]: Cross-relay forwarding of merged cells
//! - [`tombstone`]: Tombstone garbage collection
//! - [`resilience`]: Circuit breakers and retry logic

pub mod config;
pub mod error;
pub mod hlc;
pub mod row;
pub mod change;
pub mod crypto;
pub mod storage;
pub mod backend;
pub mod batching;
pub mod resilience;
pub mod locks;
pub mod cursor;
pub mod dirty;
pub mod scanner;
pub mod push;
pub mod pull;
pub mod forward;
pub mod tombstone;
pub mod coordinator;
pub mod metrics;

pub use config::SyncEngineConfig;
pub use error::SyncError;
pub use coordinator::{BackendStatus, CycleReport, EngineState, SyncEngine, SyncStatus};
pub use hlc::{Hlc, HlcClock, ManualTimeSource, SystemTimeSource, TimeSource};
pub use row::Row;
pub use change::{ColumnChange, PulledChange};
pub use crypto::{ChaChaColumnCipher, ColumnCipher, CryptoError};
pub use storage::{InMemoryStore, ReplicaStore, SqlStore, StorageError};
pub use backend::{BackendError, InMemoryRelay, PullRequest, PullResponse, PushStatus, RelayBackend};
pub use cursor::BackendCursor;
pub use dirty::DirtyTableEntry;
pub use resilience::circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitState};
pub use resilience::retry::RetryConfig;
pub use metrics::LatencyTimer;
