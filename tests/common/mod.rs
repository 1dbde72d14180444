// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Shared fixtures: devices with their own store and manual clock.

#![allow(dead_code)]

use std::sync::Arc;
use tokio::sync::watch;

use replica_sync::storage::{ReplicaStore, ScanQuery};
use replica_sync::{ChaChaColumnCipher, InMemoryStore, ManualTimeSource, Row, SyncEngine, SyncEngineConfig};

/// Key shared by every device of one test "user".
pub const KEY: [u8; 32] = [42u8; 32];

pub struct Device {
    pub engine: SyncEngine,
    pub store: Arc<InMemoryStore>,
    pub time: Arc<ManualTimeSource>,
}

/// Config that never trips a circuit during a test.
pub fn test_config() -> SyncEngineConfig {
    SyncEngineConfig { circuit_window: 1_000, ..Default::default() }
}

pub async fn device(start_ms: u64) -> Device {
    device_with(start_ms, test_config()).await
}

pub async fn device_with(start_ms: u64, config: SyncEngineConfig) -> Device {
    let store = Arc::new(InMemoryStore::new());
    store.create_table("notes", &["title", "body"]);
    let time = Arc::new(ManualTimeSource::new(start_ms));
    let (_tx, rx) = watch::channel(config.clone());
    let engine = SyncEngine::open_with_time_source(
        config,
        rx,
        store.clone(),
        Arc::new(ChaChaColumnCipher::new(&KEY).unwrap()),
        time.clone(),
    )
    .await
    .unwrap();
    Device { engine, store, time }
}

/// Every row of a table, ordered by id.
pub async fn rows(store: &dyn ReplicaStore, table: &str) -> Vec<Row> {
    let mut rows = store
        .scan_rows(table, &ScanQuery { since: None, after: None, limit: usize::MAX })
        .await
        .unwrap();
    rows.sort_by_key(|row| row.id);
    rows
}

/// Two sync rounds over every device: the first spreads every device's
/// changes to the relay, the second brings everyone up to date.
pub async fn settle(devices: &[&Device], backend_id: &str) {
    for _ in 0..2 {
        for device in devices {
            device.engine.sync_backend(backend_id).await.unwrap();
        }
    }
}
