// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process relay with the full compare-and-swap contract.
//!
//! Keeps the latest sealed value per cell in a log ordered by ingestion
//! timestamp. Replacing a cell moves it to the end of the log, so a pull
//! after the replacement sees the new value exactly once.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::debug;

use super::traits::{BackendError, PullRequest, PullResponse, PushStatus, RelayBackend};
use crate::change::{ChangeKey, ColumnChange, PulledChange};

#[derive(Default)]
struct RelayState {
    last_server_timestamp: i64,
    log: BTreeMap<i64, ColumnChange>,
    index: HashMap<ChangeKey, i64>,
}

pub struct InMemoryRelay {
    id: String,
    state: Mutex<RelayState>,
    offline: AtomicBool,
    push_calls: AtomicU64,
    pull_calls: AtomicU64,
}

impl InMemoryRelay {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            state: Mutex::new(RelayState::default()),
            offline: AtomicBool::new(false),
            push_calls: AtomicU64::new(0),
            pull_calls: AtomicU64::new(0),
        }
    }

    /// Simulate loss of connectivity: every call fails with a transport error.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Number of cells held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().index.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Latest stored record for a cell.
    #[must_use]
    pub fn stored(&self, key: &ChangeKey) -> Option<ColumnChange> {
        let state = self.state.lock();
        state.index.get(key).and_then(|ts| state.log.get(ts)).cloned()
    }

    #[must_use]
    pub fn push_calls(&self) -> u64 {
        self.push_calls.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn pull_calls(&self) -> u64 {
        self.pull_calls.load(Ordering::Relaxed)
    }

    fn check_online(&self) -> Result<(), BackendError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(BackendError::Transport(format!("relay '{}' unreachable", self.id)));
        }
        Ok(())
    }
}

#[async_trait]
impl RelayBackend for InMemoryRelay {
    fn id(&self) -> &str {
        &self.id
    }

    async fn push(&self, changes: &[ColumnChange]) -> Result<Vec<PushStatus>, BackendError> {
        self.push_calls.fetch_add(1, Ordering::Relaxed);
        self.check_online()?;

        let mut state = self.state.lock();
        let mut statuses = Vec::with_capacity(changes.len());
        for change in changes {
            let key = change.key();
            let stale = state
                .index
                .get(&key)
                .and_then(|ts| state.log.get(ts))
                .is_some_and(|stored| stored.hlc_timestamp >= change.hlc_timestamp);
            if stale {
                statuses.push(PushStatus::Superseded);
                continue;
            }

            if let Some(old) = state.index.remove(&key) {
                state.log.remove(&old);
            }
            let server_timestamp = chrono::Utc::now()
                .timestamp_millis()
                .max(state.last_server_timestamp + 1);
            state.last_server_timestamp = server_timestamp;
            state.log.insert(server_timestamp, change.clone());
            state.index.insert(key, server_timestamp);
            statuses.push(PushStatus::Accepted);
        }
        debug!(relay = %self.id, records = changes.len(), "Relay push applied");
        Ok(statuses)
    }

    async fn pull(&self, request: &PullRequest) -> Result<PullResponse, BackendError> {
        self.pull_calls.fetch_add(1, Ordering::Relaxed);
        self.check_online()?;

        let state = self.state.lock();
        let mut matching = state
            .log
            .range(request.after_server_timestamp.saturating_add(1)..)
            .filter(|(_, change)| request.exclude_device_id != Some(change.device_id))
            .map(|(ts, change)| PulledChange { change: change.clone(), server_timestamp: *ts });

        let changes: Vec<PulledChange> = matching.by_ref().take(request.limit).collect();
        let has_more = matching.next().is_some();
        Ok(PullResponse { changes, has_more })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hlc::Hlc;
    use uuid::Uuid;

    fn change(column: &str, physical_ms: u64, device: Uuid) -> ColumnChange {
        ColumnChange {
            table: "notes".into(),
            row_pk: "row".into(),
            column_name: column.into(),
            hlc_timestamp: Hlc::new(physical_ms, 0, device),
            device_id: device,
            encrypted_value: format!("v{physical_ms}"),
            nonce: "00".into(),
            batch_id: "b".into(),
            batch_seq: 0,
            batch_total: 1,
        }
    }

    fn pull_all(after: i64) -> PullRequest {
        PullRequest { after_server_timestamp: after, exclude_device_id: None, limit: 100 }
    }

    #[tokio::test]
    async fn test_cas_accepts_only_strictly_newer() {
        let relay = InMemoryRelay::new("r");
        let device = Uuid::new_v4();

        let statuses = relay
            .push(&[change("title", 10, device), change("title", 10, device), change("title", 5, device)])
            .await
            .unwrap();
        assert_eq!(statuses, vec![PushStatus::Accepted, PushStatus::Superseded, PushStatus::Superseded]);

        let statuses = relay.push(&[change("title", 11, device)]).await.unwrap();
        assert_eq!(statuses, vec![PushStatus::Accepted]);
        assert_eq!(relay.len(), 1);
        assert_eq!(relay.stored(&change("title", 0, device).key()).unwrap().encrypted_value, "v11");
    }

    #[tokio::test]
    async fn test_pull_is_ordered_and_paged() {
        let relay = InMemoryRelay::new("r");
        let device = Uuid::new_v4();
        for (i, column) in ["a", "b", "c"].iter().enumerate() {
            relay.push(&[change(column, i as u64 + 1, device)]).await.unwrap();
        }

        let first = relay
            .pull(&PullRequest { after_server_timestamp: 0, exclude_device_id: None, limit: 2 })
            .await
            .unwrap();
        assert_eq!(first.changes.len(), 2);
        assert!(first.has_more);
        assert!(first.changes[0].server_timestamp < first.changes[1].server_timestamp);

        let after = first.changes[1].server_timestamp;
        let rest = relay.pull(&pull_all(after)).await.unwrap();
        assert_eq!(rest.changes.len(), 1);
        assert_eq!(rest.changes[0].change.column_name, "c");
        assert!(!rest.has_more);
    }

    #[tokio::test]
    async fn test_pull_excludes_device() {
        let relay = InMemoryRelay::new("r");
        let me = Uuid::new_v4();
        let peer = Uuid::new_v4();
        relay.push(&[change("a", 1, me), change("b", 2, peer)]).await.unwrap();

        let response = relay
            .pull(&PullRequest { after_server_timestamp: 0, exclude_device_id: Some(me), limit: 10 })
            .await
            .unwrap();
        assert_eq!(response.changes.len(), 1);
        assert_eq!(response.changes[0].change.device_id, peer);
    }

    #[tokio::test]
    async fn test_replaced_cell_is_redelivered_once() {
        let relay = InMemoryRelay::new("r");
        let device = Uuid::new_v4();
        relay.push(&[change("a", 1, device)]).await.unwrap();
        let first = relay.pull(&pull_all(0)).await.unwrap();
        let seen = first.changes[0].server_timestamp;

        relay.push(&[change("a", 2, device)]).await.unwrap();
        let next = relay.pull(&pull_all(seen)).await.unwrap();
        assert_eq!(next.changes.len(), 1);
        assert_eq!(next.changes[0].change.hlc_timestamp.physical_ms, 2);
        assert_eq!(relay.pull(&pull_all(0)).await.unwrap().changes.len(), 1);
    }

    #[tokio::test]
    async fn test_offline_relay_fails_with_transport_error() {
        let relay = InMemoryRelay::new("r");
        relay.set_offline(true);
        assert!(matches!(relay.pull(&pull_all(0)).await, Err(BackendError::Transport(_))));
        assert!(matches!(relay.push(&[]).await, Err(BackendError::Transport(_))));
        relay.set_offline(false);
        assert!(relay.pull(&pull_all(0)).await.is_ok());
        assert_eq!(relay.pull_calls(), 2);
    }
}
