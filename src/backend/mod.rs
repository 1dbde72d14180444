// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Relay backends.
//!
//! A relay stores sealed column values keyed by `(table, rowPk, columnName)`
//! and hands them back in ingestion order. It never sees plaintext and never
//! resolves conflicts beyond its compare-and-swap on the column stamp.

pub mod traits;
pub mod memory;

pub use traits::{BackendError, PullRequest, PullResponse, PushStatus, RelayBackend};
pub use memory::InMemoryRelay;
