// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Top-level error type.

use std::time::Duration;
use thiserror::Error;

use crate::backend::BackendError;
use crate::crypto::CryptoError;
use crate::hlc::HlcParseError;
use crate::row::RowError;
use crate::storage::traits::StorageError;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("backend '{backend}': {source}")]
    Backend {
        backend: String,
        #[source]
        source: BackendError,
    },

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Hlc(#[from] HlcParseError),

    #[error(transparent)]
    Row(#[from] RowError),

    #[error("value encoding error: {0}")]
    Encoding(String),

    #[error("sync cycle for '{backend}' timed out after {after:?}")]
    Timeout { backend: String, after: Duration },

    #[error("circuit open for backend '{0}', request rejected")]
    CircuitOpen(String),

    #[error("unknown backend '{0}'")]
    UnknownBackend(String),

    #[error("backend '{0}' is already registered")]
    DuplicateBackend(String),

    #[error("backend '{0}' is disabled")]
    BackendDisabled(String),

    #[error("table '{0}' is not a replicated table")]
    UnknownTable(String),

    #[error("table '{table}' has no column '{column}'")]
    UnknownColumn { table: String, column: String },

    #[error("column '{0}' is managed by the replication layer")]
    ReservedColumn(String),

    #[error("row {id} not found in '{table}'")]
    RowNotFound { table: String, id: String },

    #[error("engine is shutting down")]
    ShuttingDown,
}

impl SyncError {
    /// Failures a later cycle can be expected to get past without intervention.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Backend { source: BackendError::Transport(_), .. }
                | Self::Timeout { .. }
                | Self::CircuitOpen(_)
        )
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        Self::Encoding(err.to_string())
    }
}
