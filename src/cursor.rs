// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-backend sync watermarks.
//!
//! Each backend owns one [`BackendCursor`]. Cursors only move forwards, and
//! only after the work they cover is confirmed; the one way back is an
//! explicit [`CursorStore::reset`] when a backend is re-provisioned.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

use crate::hlc::Hlc;
use crate::storage::traits::{ReplicaStore, StorageError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendCursor {
    pub backend_id: String,
    /// Every local column stamp at or below this has been accepted by the backend
    pub last_push_hlc: Option<Hlc>,
    /// Highest relay ingestion timestamp fully applied locally
    pub last_pull_server_timestamp: Option<i64>,
    /// Epoch millis of the last change to this record
    pub updated_at: i64,
}

impl BackendCursor {
    #[must_use]
    pub fn new(backend_id: impl Into<String>) -> Self {
        Self {
            backend_id: backend_id.into(),
            last_push_hlc: None,
            last_pull_server_timestamp: None,
            updated_at: now_ms(),
        }
    }

    /// Both directions have completed at least once.
    #[must_use]
    pub fn is_converged(&self) -> bool {
        self.last_push_hlc.is_some() && self.last_pull_server_timestamp.is_some()
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Monotonic access to persisted cursors.
pub struct CursorStore {
    store: Arc<dyn ReplicaStore>,
}

impl CursorStore {
    pub fn new(store: Arc<dyn ReplicaStore>) -> Self {
        Self { store }
    }

    pub async fn get(&self, backend_id: &str) -> Result<Option<BackendCursor>, StorageError> {
        self.store.load_cursor(backend_id).await
    }

    pub async fn all(&self) -> Result<Vec<BackendCursor>, StorageError> {
        self.store.load_cursors().await
    }

    /// Raise the push watermark. Lower values are ignored.
    pub async fn advance_push(&self, backend_id: &str, hlc: Hlc) -> Result<BackendCursor, StorageError> {
        let mut cursor = self.load_or_new(backend_id).await?;
        if cursor.last_push_hlc.map_or(true, |current| hlc > current) {
            cursor.last_push_hlc = Some(hlc);
            cursor.updated_at = now_ms();
            self.store.save_cursor(&cursor).await?;
            debug!(backend = %backend_id, push_hlc = %hlc, "Push cursor advanced");
        }
        Ok(cursor)
    }

    /// Raise the pull watermark. Lower values are ignored.
    pub async fn advance_pull(&self, backend_id: &str, server_timestamp: i64) -> Result<BackendCursor, StorageError> {
        let mut cursor = self.load_or_new(backend_id).await?;
        if cursor.last_pull_server_timestamp.map_or(true, |current| server_timestamp > current) {
            cursor.last_pull_server_timestamp = Some(server_timestamp);
            cursor.updated_at = now_ms();
            self.store.save_cursor(&cursor).await?;
            debug!(backend = %backend_id, server_timestamp, "Pull cursor advanced");
        }
        Ok(cursor)
    }

    /// Forget a backend's watermarks (operator re-provisioning).
    pub async fn reset(&self, backend_id: &str) -> Result<(), StorageError> {
        self.store.delete_cursor(backend_id).await?;
        info!(backend = %backend_id, "Backend cursor reset; next cycle runs a full sync");
        Ok(())
    }

    async fn load_or_new(&self, backend_id: &str) -> Result<BackendCursor, StorageError> {
        Ok(self
            .store
            .load_cursor(backend_id)
            .await?
            .unwrap_or_else(|| BackendCursor::new(backend_id)))
    }
}
