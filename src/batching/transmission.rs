// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Push transmissions and their chunking.
//!
//! All changes one push phase sends to a backend form a single transmission:
//! one `batchId`, with every record numbered `batchSeq` out of `batchTotal`.
//! A receiver can tell from those fields whether it has seen the whole
//! transmission; since each record merges independently, applying a partial
//! one is still safe.
//!
//! The transmission goes out in chunks bounded by record count and bytes,
//! whichever limit is hit first.
//!
//! # Example
//!
//! ```
//! use replica_sync::batching::{BatchLimits, Transmission};
//!
//! let limits = BatchLimits { max_records: 2, max_bytes: usize::MAX };
//! let transmission = Transmission::new(Vec::new(), limits);
//! assert_eq!(transmission.total(), 0);
//! assert!(transmission.into_chunks().is_empty());
//! ```

use tracing::debug;
use uuid::Uuid;

use crate::change::ColumnChange;

/// Why a chunk was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    /// Record count limit reached
    Count,
    /// Byte limit reached
    Size,
    /// End of the transmission
    Final,
}

#[derive(Debug, Clone, Copy)]
pub struct BatchLimits {
    pub max_records: usize,
    pub max_bytes: usize,
}

impl Default for BatchLimits {
    fn default() -> Self {
        Self {
            max_records: 500,
            max_bytes: 1024 * 1024, // 1 MB
        }
    }
}

/// One chunk of a transmission, ready to submit.
#[derive(Debug)]
pub struct FlushBatch {
    pub changes: Vec<ColumnChange>,
    pub total_bytes: usize,
    pub reason: FlushReason,
}

/// A numbered set of changes bound for one backend.
pub struct Transmission {
    batch_id: String,
    changes: Vec<ColumnChange>,
    limits: BatchLimits,
}

impl Transmission {
    /// Stamp `changes` with a fresh batch id and their sequence numbers.
    pub fn new(mut changes: Vec<ColumnChange>, limits: BatchLimits) -> Self {
        let batch_id = Uuid::new_v4().to_string();
        let total = u32::try_from(changes.len()).unwrap_or(u32::MAX);
        for (seq, change) in changes.iter_mut().enumerate() {
            change.batch_id = batch_id.clone();
            change.batch_seq = u32::try_from(seq).unwrap_or(u32::MAX);
            change.batch_total = total;
        }
        Self { batch_id, changes, limits }
    }

    #[must_use]
    pub fn batch_id(&self) -> &str {
        &self.batch_id
    }

    #[must_use]
    pub fn total(&self) -> usize {
        self.changes.len()
    }

    /// Split into submission chunks. Every chunk holds at least one record.
    #[must_use]
    pub fn into_chunks(self) -> Vec<FlushBatch> {
        let max_records = self.limits.max_records.max(1);
        let mut chunks = Vec::new();
        let mut current: Vec<ColumnChange> = Vec::new();
        let mut bytes = 0usize;

        for change in self.changes {
            let size = change.wire_size();
            if !current.is_empty() && bytes + size > self.limits.max_bytes {
                chunks.push(FlushBatch {
                    changes: std::mem::take(&mut current),
                    total_bytes: std::mem::take(&mut bytes),
                    reason: FlushReason::Size,
                });
            }
            current.push(change);
            bytes += size;
            if current.len() >= max_records {
                chunks.push(FlushBatch {
                    changes: std::mem::take(&mut current),
                    total_bytes: std::mem::take(&mut bytes),
                    reason: FlushReason::Count,
                });
            }
        }
        if !current.is_empty() {
            chunks.push(FlushBatch { changes: current, total_bytes: bytes, reason: FlushReason::Final });
        }

        debug!(batch_id = %self.batch_id, chunks = chunks.len(), "Transmission chunked");
        chunks
    }
}
