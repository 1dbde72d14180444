// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Column-change records.
//!
//! [`ColumnChange`] is the unit of replication on the wire. Everything except
//! `encrypted_value` is routing metadata visible to the relay; the value itself
//! is sealed per column (see [`crate::crypto`]).
//!
//! ```json
//! {
//!   "table": "notes",
//!   "rowPk": "0b7c...",
//!   "columnName": "title",
//!   "hlcTimestamp": "0000018f2a3b4c5d-00000000-6f1c...",
//!   "deviceId": "6f1c...",
//!   "encryptedValue": "9a0f...",
//!   "nonce": "4e21...",
//!   "batchId": "d2b1...",
//!   "batchSeq": 0,
//!   "batchTotal": 12
//! }
//! ```

use crate::hlc::Hlc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// One column write as transmitted to and from relay backends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnChange {
    pub table: String,
    /// Serialized primary key (hyphenated UUID)
    pub row_pk: String,
    pub column_name: String,
    pub hlc_timestamp: Hlc,
    pub device_id: Uuid,
    /// Hex-encoded ciphertext
    pub encrypted_value: String,
    /// Hex-encoded nonce
    pub nonce: String,
    pub batch_id: String,
    pub batch_seq: u32,
    pub batch_total: u32,
}

impl ColumnChange {
    /// The relay's compare-and-swap key.
    #[must_use]
    pub fn key(&self) -> ChangeKey {
        ChangeKey {
            table: self.table.clone(),
            row_pk: self.row_pk.clone(),
            column_name: self.column_name.clone(),
        }
    }

    /// Approximate transmitted size, used to bound push batches.
    #[must_use]
    pub fn wire_size(&self) -> usize {
        self.table.len()
            + self.row_pk.len()
            + self.column_name.len()
            + self.encrypted_value.len()
            + self.nonce.len()
            + self.batch_id.len()
            + 128
    }
}

/// `(table, rowPk, columnName)` identity of a replicated cell.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChangeKey {
    pub table: String,
    pub row_pk: String,
    pub column_name: String,
}

/// A change as returned by a pull, tagged with the relay's ingestion time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PulledChange {
    #[serde(flatten)]
    pub change: ColumnChange,
    pub server_timestamp: i64,
}

/// Plaintext column write found by the scanner, not yet sealed.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeCandidate {
    pub table: String,
    pub row_id: Uuid,
    pub column: String,
    pub hlc: Hlc,
    pub value: Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> ColumnChange {
        ColumnChange {
            table: "notes".into(),
            row_pk: Uuid::from_u128(1).to_string(),
            column_name: "title".into(),
            hlc_timestamp: Hlc::new(42, 1, Uuid::from_u128(2)),
            device_id: Uuid::from_u128(2),
            encrypted_value: "abcd".into(),
            nonce: "00ff".into(),
            batch_id: "batch-1".into(),
            batch_seq: 0,
            batch_total: 1,
        }
    }

    #[test]
    fn test_wire_field_names_are_camel_case() {
        let value = serde_json::to_value(sample()).unwrap();
        for field in [
            "table", "rowPk", "columnName", "hlcTimestamp", "deviceId",
            "encryptedValue", "nonce", "batchId", "batchSeq", "batchTotal",
        ] {
            assert!(value.get(field).is_some(), "missing {field}");
        }
        assert_eq!(value["hlcTimestamp"], json!(sample().hlc_timestamp.to_string()));
    }

    #[test]
    fn test_pulled_change_flattens_record() {
        let pulled = PulledChange { change: sample(), server_timestamp: 77 };
        let value = serde_json::to_value(&pulled).unwrap();
        assert_eq!(value["serverTimestamp"], json!(77));
        assert_eq!(value["columnName"], json!("title"));

        let back: PulledChange = serde_json::from_value(value).unwrap();
        assert_eq!(back, pulled);
    }

    #[test]
    fn test_malformed_hlc_rejected_on_decode() {
        let mut value = serde_json::to_value(sample()).unwrap();
        value["hlcTimestamp"] = json!("not-an-hlc");
        assert!(serde_json::from_value::<ColumnChange>(value).is_err());
    }
}
