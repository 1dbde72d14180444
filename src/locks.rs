// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Row locks and the commit gate.
//!
//! Merges, local writes and purges are read-modify-write on a single row and
//! run under that row's stripe lock, so two pull pipelines merging the same
//! row from different backends cannot lose each other's columns.
//!
//! The commit gate orders stamping against scanning. Writers hold a shared
//! guard from the moment they take a stamp until the row is stored. The push
//! phase takes the gate exclusively for an instant to read the clock: every
//! stamp at or below that ceiling is then committed, and every later stamp is
//! above it.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use tokio::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard};
use uuid::Uuid;

use crate::hlc::{Hlc, HlcClock};

pub struct ReplicaLocks {
    stripes: Vec<Mutex<()>>,
    gate: RwLock<()>,
}

impl ReplicaLocks {
    pub fn new(stripes: usize) -> Self {
        Self {
            stripes: (0..stripes.max(1)).map(|_| Mutex::new(())).collect(),
            gate: RwLock::new(()),
        }
    }

    /// Exclusive access to one row for a read-modify-write.
    pub async fn lock_row(&self, table: &str, id: Uuid) -> MutexGuard<'_, ()> {
        self.stripes[self.stripe(table, id)].lock().await
    }

    /// Shared commit guard for stamping and storing writes.
    pub async fn commit(&self) -> RwLockReadGuard<'_, ()> {
        self.gate.read().await
    }

    /// Inclusive ceiling on every committed stamp.
    pub async fn snapshot_ceiling(&self, clock: &HlcClock) -> Option<Hlc> {
        self.snapshot_ceiling_with(clock, |ceiling| ceiling).await
    }

    /// Like [`snapshot_ceiling`](Self::snapshot_ceiling), running `f` on the
    /// ceiling before any new commit can start.
    pub async fn snapshot_ceiling_with<R>(&self, clock: &HlcClock, f: impl FnOnce(Option<Hlc>) -> R) -> R {
        let _exclusive = self.gate.write().await;
        f(clock.ceiling())
    }

    fn stripe(&self, table: &str, id: Uuid) -> usize {
        let mut hasher = DefaultHasher::new();
        table.hash(&mut hasher);
        id.hash(&mut hasher);
        (hasher.finish() % self.stripes.len() as u64) as usize
    }
}
