// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Push pipeline.
//!
//! Seals each candidate column on its own, numbers the whole set as one
//! transmission, submits it in bounded chunks and only then moves the
//! backend's push cursor. A failed chunk leaves the cursor where it was; the
//! next cycle rescans and resubmits, and the relay's compare-and-swap turns
//! anything it already holds into a supersede.
//!
//! Forwarded cells (see [`crate::forward`]) ride in the same transmission
//! but sit below the cursor by construction, so they never move it.

use std::collections::HashSet;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::{BackendError, PushStatus, RelayBackend};
use crate::batching::{BatchLimits, Transmission};
use crate::change::{ChangeCandidate, ColumnChange};
use crate::crypto::{CellContext, ColumnCipher};
use crate::cursor::CursorStore;
use crate::error::SyncError;
use crate::hlc::Hlc;
use crate::resilience::circuit_breaker::{CircuitBreaker, CircuitError};

/// Outcome of one push phase.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushReport {
    /// Changes submitted to the relay
    pub submitted: usize,
    /// Stored by the relay
    pub accepted: usize,
    /// Relay already held an equal or newer stamp
    pub superseded: usize,
    /// Forwarded cells among the submitted
    pub forwarded: usize,
    /// Chunks sent
    pub chunks: usize,
    /// Push cursor after the phase
    pub cursor: Option<Hlc>,
}

/// Seal one candidate into a wire record (batch fields are filled in later).
pub fn seal_candidate(
    cipher: &dyn ColumnCipher,
    device_id: Uuid,
    candidate: &ChangeCandidate,
) -> Result<ColumnChange, SyncError> {
    let row_pk = candidate.row_id.to_string();
    let plaintext = serde_json::to_vec(&candidate.value)?;
    let cell = CellContext {
        table: &candidate.table,
        row_pk: &row_pk,
        column: &candidate.column,
    };
    let sealed = cipher.encrypt(&plaintext, &cell)?;
    let (encrypted_value, nonce) = sealed.to_hex();

    Ok(ColumnChange {
        table: candidate.table.clone(),
        row_pk,
        column_name: candidate.column.clone(),
        hlc_timestamp: candidate.hlc,
        device_id,
        encrypted_value,
        nonce,
        batch_id: String::new(),
        batch_seq: 0,
        batch_total: 0,
    })
}

pub struct PushPipeline<'a> {
    pub backend: &'a dyn RelayBackend,
    pub circuit: &'a CircuitBreaker,
    pub cipher: &'a dyn ColumnCipher,
    pub cursors: &'a CursorStore,
    pub device_id: Uuid,
    pub limits: BatchLimits,
}

impl PushPipeline<'_> {
    /// Submit scanned `candidates` plus `forwarded` cells, then advance the
    /// push cursor to the highest scanned stamp on full acceptance.
    pub async fn run(
        &self,
        candidates: &[ChangeCandidate],
        forwarded: &[ChangeCandidate],
    ) -> Result<PushReport, SyncError> {
        let backend_id = self.backend.id();
        let scanned: HashSet<(&str, Uuid, &str, Hlc)> = candidates
            .iter()
            .map(|c| (c.table.as_str(), c.row_id, c.column.as_str(), c.hlc))
            .collect();
        let extra: Vec<&ChangeCandidate> = forwarded
            .iter()
            .filter(|c| !scanned.contains(&(c.table.as_str(), c.row_id, c.column.as_str(), c.hlc)))
            .collect();
        if candidates.is_empty() && extra.is_empty() {
            let cursor = self.cursors.get(backend_id).await?.and_then(|c| c.last_push_hlc);
            debug!(backend = %backend_id, "Nothing to push");
            return Ok(PushReport { cursor, ..Default::default() });
        }

        let start = Instant::now();
        let sealed = candidates
            .iter()
            .chain(extra.iter().copied())
            .map(|candidate| seal_candidate(self.cipher, self.device_id, candidate))
            .collect::<Result<Vec<_>, SyncError>>()?;
        let max_hlc = candidates.iter().map(|c| c.hlc).max();

        let transmission = Transmission::new(sealed, self.limits);
        let batch_id = transmission.batch_id().to_string();
        let mut report = PushReport {
            submitted: transmission.total(),
            forwarded: extra.len(),
            ..Default::default()
        };

        for chunk in transmission.into_chunks() {
            let statuses = self.submit(&chunk.changes).await?;
            crate::metrics::record_push_batch(backend_id, chunk.changes.len(), chunk.total_bytes);
            report.chunks += 1;

            for (change, status) in chunk.changes.iter().zip(&statuses) {
                match status {
                    PushStatus::Accepted => report.accepted += 1,
                    PushStatus::Superseded => {
                        report.superseded += 1;
                        debug!(
                            backend = %backend_id,
                            table = %change.table,
                            row = %change.row_pk,
                            column = %change.column_name,
                            hlc = %change.hlc_timestamp,
                            "Relay holds a newer value; change superseded"
                        );
                    }
                }
            }
        }

        crate::metrics::record_pushed(backend_id, report.accepted);
        crate::metrics::record_superseded(backend_id, report.superseded);

        report.cursor = match max_hlc {
            Some(max_hlc) => self.cursors.advance_push(backend_id, max_hlc).await?.last_push_hlc,
            None => self.cursors.get(backend_id).await?.and_then(|c| c.last_push_hlc),
        };

        info!(
            backend = %backend_id,
            batch_id = %batch_id,
            submitted = report.submitted,
            forwarded = report.forwarded,
            accepted = report.accepted,
            superseded = report.superseded,
            chunks = report.chunks,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Push complete"
        );
        Ok(report)
    }

    async fn submit(&self, changes: &[ColumnChange]) -> Result<Vec<PushStatus>, SyncError> {
        let backend_id = self.backend.id();
        let statuses = match self.circuit.call(|| self.backend.push(changes)).await {
            Ok(statuses) => statuses,
            Err(CircuitError::Rejected) => return Err(SyncError::CircuitOpen(backend_id.to_string())),
            Err(CircuitError::Inner(source)) => {
                warn!(backend = %backend_id, error = %source, "Push failed; cursor left unchanged");
                return Err(SyncError::Backend { backend: backend_id.to_string(), source });
            }
        };

        if statuses.len() != changes.len() {
            return Err(SyncError::Backend {
                backend: backend_id.to_string(),
                source: BackendError::Protocol(format!(
                    "push returned {} statuses for {} records",
                    statuses.len(),
                    changes.len()
                )),
            });
        }
        Ok(statuses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryRelay;
    use crate::crypto::ChaChaColumnCipher;
    use crate::resilience::circuit_breaker::CircuitConfig;
    use crate::storage::memory::InMemoryStore;
    use serde_json::json;
    use std::sync::Arc;

    struct Fixture {
        relay: InMemoryRelay,
        circuit: CircuitBreaker,
        cipher: ChaChaColumnCipher,
        cursors: CursorStore,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                relay: InMemoryRelay::new("relay-a"),
                circuit: CircuitBreaker::new("relay-a", CircuitConfig::default()),
                cipher: ChaChaColumnCipher::new(&ChaChaColumnCipher::generate_key()).unwrap(),
                cursors: CursorStore::new(Arc::new(InMemoryStore::new())),
            }
        }

        fn pipeline(&self, max_records: usize) -> PushPipeline<'_> {
            PushPipeline {
                backend: &self.relay,
                circuit: &self.circuit,
                cipher: &self.cipher,
                cursors: &self.cursors,
                device_id: Uuid::new_v4(),
                limits: BatchLimits { max_records, max_bytes: usize::MAX },
            }
        }
    }

    fn candidate(column: &str, physical_ms: u64) -> ChangeCandidate {
        ChangeCandidate {
            table: "notes".into(),
            row_id: Uuid::new_v4(),
            column: column.into(),
            hlc: Hlc::new(physical_ms, 0, Uuid::nil()),
            value: json!("v"),
        }
    }

    #[tokio::test]
    async fn test_push_advances_cursor_to_max_submitted() {
        let fx = Fixture::new();
        let candidates = vec![candidate("a", 30), candidate("b", 10), candidate("c", 20)];

        let report = fx.pipeline(2).run(&candidates, &[]).await.unwrap();
        assert_eq!(report.submitted, 3);
        assert_eq!(report.accepted, 3);
        assert_eq!(report.chunks, 2);
        assert_eq!(report.cursor.map(|c| c.physical_ms), Some(30));
        assert_eq!(fx.relay.len(), 3);
    }

    #[tokio::test]
    async fn test_resubmission_is_superseded_not_an_error() {
        let fx = Fixture::new();
        let candidates = vec![candidate("a", 5)];
        fx.pipeline(10).run(&candidates, &[]).await.unwrap();

        let report = fx.pipeline(10).run(&candidates, &[]).await.unwrap();
        assert_eq!(report.accepted, 0);
        assert_eq!(report.superseded, 1);
        assert_eq!(fx.relay.len(), 1);
    }

    #[tokio::test]
    async fn test_transport_failure_leaves_cursor() {
        let fx = Fixture::new();
        fx.relay.set_offline(true);

        let err = fx.pipeline(10).run(&[candidate("a", 5)], &[]).await.unwrap_err();
        assert!(err.is_transient());
        assert!(fx.cursors.get("relay-a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_empty_push_reports_existing_cursor() {
        let fx = Fixture::new();
        let report = fx.pipeline(10).run(&[], &[]).await.unwrap();
        assert_eq!(report, PushReport::default());
        assert_eq!(fx.relay.push_calls(), 0);
    }

    #[tokio::test]
    async fn test_forwarded_cells_are_sent_without_moving_cursor() {
        let fx = Fixture::new();
        fx.pipeline(10).run(&[candidate("a", 50)], &[]).await.unwrap();

        let scanned = candidate("b", 60);
        let forwarded = vec![candidate("c", 20), scanned.clone()];
        let report = fx.pipeline(10).run(&[scanned], &forwarded).await.unwrap();
        assert_eq!(report.submitted, 2);
        assert_eq!(report.forwarded, 1);
        assert_eq!(report.cursor.map(|c| c.physical_ms), Some(60));

        let only_forwarded = fx.pipeline(10).run(&[], &[candidate("d", 10)]).await.unwrap();
        assert_eq!(only_forwarded.accepted, 1);
        assert_eq!(only_forwarded.cursor.map(|c| c.physical_ms), Some(60));
        assert_eq!(fx.relay.len(), 4);
    }

    #[test]
    fn test_sealed_value_is_not_plaintext() {
        let cipher = ChaChaColumnCipher::new(&ChaChaColumnCipher::generate_key()).unwrap();
        let mut c = candidate("title", 1);
        c.value = json!("secret title");
        let sealed = seal_candidate(&cipher, Uuid::nil(), &c).unwrap();
        assert_eq!(sealed.row_pk, c.row_id.to_string());
        assert!(!sealed.encrypted_value.contains(&hex::encode("secret")));
        assert_eq!(sealed.nonce.len(), 24);
    }
}
