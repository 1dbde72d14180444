// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Local replica storage.
//!
//! - [`traits::ReplicaStore`]: what the engine needs from the local database
//! - [`memory::InMemoryStore`]: reference store for tests and ephemeral replicas
//! - [`sql::SqlStore`]: SQLite with trigger-based dirty tracking

pub mod traits;
pub mod memory;
pub mod sql;

pub use memory::InMemoryStore;
pub use sql::SqlStore;
pub use traits::{DeferredChange, DeferredPosition, ForwardedChange, ReplicaStore, ScanQuery, StorageError};

use std::sync::Arc;
use tracing::info;

use crate::config::SyncEngineConfig;

/// Build the store named by `config.sql_url`, or an in-memory store when unset.
pub async fn connect(config: &SyncEngineConfig) -> Result<Arc<dyn ReplicaStore>, StorageError> {
    match config.sql_url.as_deref() {
        Some(url) => {
            info!(url = %url, "Opening SQL replica store");
            Ok(Arc::new(SqlStore::new(url).await?))
        }
        None => {
            info!("No sql_url configured, using in-memory replica store");
            Ok(Arc::new(InMemoryStore::new()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_defaults_to_memory() {
        let store = connect(&SyncEngineConfig::default()).await.unwrap();
        assert!(store.replicated_tables().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_connect_opens_sqlite_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = SyncEngineConfig {
            sql_url: Some(format!("sqlite://{}", dir.path().join("r.db").display())),
            ..Default::default()
        };
        let store = connect(&config).await.unwrap();
        store.set_meta("k", "v").await.unwrap();
        assert_eq!(store.get_meta("k").await.unwrap().as_deref(), Some("v"));
    }
}
