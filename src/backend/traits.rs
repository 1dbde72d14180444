// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::change::{ColumnChange, PulledChange};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("Relay transport error: {0}")]
    Transport(String),
    #[error("Relay rejected request: {0}")]
    Rejected(String),
    #[error("Relay protocol violation: {0}")]
    Protocol(String),
}

/// Per-record outcome of a push.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PushStatus {
    /// Stored; the relay now holds this stamp for the cell
    Accepted,
    /// The relay already holds an equal or newer stamp for the cell
    Superseded,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequest {
    pub after_server_timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude_device_id: Option<Uuid>,
    pub limit: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullResponse {
    /// Ordered by server timestamp, ascending
    pub changes: Vec<PulledChange>,
    pub has_more: bool,
}

/// Push/pull endpoints of one relay.
#[async_trait]
pub trait RelayBackend: Send + Sync {
    /// Stable identifier, used to namespace this relay's cursor.
    fn id(&self) -> &str;

    /// Compare-and-swap each record against the stored stamp for its cell.
    ///
    /// Returns one status per record, in input order.
    async fn push(&self, changes: &[ColumnChange]) -> Result<Vec<PushStatus>, BackendError>;

    async fn pull(&self, request: &PullRequest) -> Result<PullResponse, BackendError>;
}
