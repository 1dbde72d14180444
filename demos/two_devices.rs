// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Two devices editing the same note offline, then converging through a relay.
//!
//! Run with: `RUST_LOG=replica_sync=debug cargo run --example two_devices`

use replica_sync::{
    ChaChaColumnCipher, InMemoryRelay, InMemoryStore, SyncEngine, SyncEngineConfig, SyncError,
};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

async fn open_device(name: &str, key: &[u8; 32]) -> Result<SyncEngine, SyncError> {
    let store = Arc::new(InMemoryStore::new());
    store.create_table("notes", &["title", "body"]);

    let config = SyncEngineConfig { sync_interval_ms: 500, ..Default::default() };
    let (_tx, rx) = watch::channel(config.clone());
    let engine = SyncEngine::open(config, rx, store, Arc::new(ChaChaColumnCipher::new(key)?)).await?;
    tracing::info!(device = %name, id = %engine.device_id(), "Device opened");
    Ok(engine)
}

#[tokio::main]
async fn main() -> Result<(), SyncError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let key = ChaChaColumnCipher::generate_key();
    let relay = Arc::new(InMemoryRelay::new("relay"));
    let laptop = open_device("laptop", &key).await?;
    let phone = open_device("phone", &key).await?;
    laptop.add_backend(relay.clone())?;
    phone.add_backend(relay.clone())?;

    let id = laptop
        .insert("notes", [("title", json!("Shopping")), ("body", json!("milk"))])
        .await?;
    laptop.sync_backend("relay").await?;
    phone.sync_backend("relay").await?;

    // Both devices edit offline: different columns, so both edits survive.
    laptop.update("notes", id, [("title", json!("Shopping (Saturday)"))]).await?;
    phone.update("notes", id, [("body", json!("milk, eggs"))]).await?;

    for _ in 0..2 {
        laptop.sync_backend("relay").await?;
        phone.sync_backend("relay").await?;
    }

    for (name, engine) in [("laptop", &laptop), ("phone", &phone)] {
        if let Some(row) = engine.get("notes", id).await? {
            println!(
                "{name:>6}: title={} body={} stamp={}",
                row.value("title").unwrap_or_default(),
                row.value("body").unwrap_or_default(),
                row.row_timestamp.map(|h| h.to_string()).unwrap_or_default(),
            );
        }
    }
    println!("relay holds {} cells", relay.len());

    laptop.shutdown().await;
    phone.shutdown().await;
    Ok(())
}
