// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Property-based tests (fuzzing) for the merge rules and wire parsing.
//!
//! Uses proptest to generate write histories and malformed inputs and verify
//! that merging is order-insensitive and parsing never panics.
//!
//! Run with: `cargo test --test proptest_fuzz`

use proptest::prelude::*;
use serde_json::{json, Value};
use std::str::FromStr;
use uuid::Uuid;

use replica_sync::row::TOMBSTONE_COLUMN;
use replica_sync::{ColumnChange, Hlc, Row};

// =============================================================================
// Strategies for generating test data
// =============================================================================

const COLUMNS: [&str; 4] = ["title", "body", "rank", TOMBSTONE_COLUMN];

fn device(n: u8) -> Uuid {
    Uuid::from_bytes([n; 16])
}

/// One column write. Counters are made unique per history by the caller so
/// no two writes share a stamp.
#[derive(Debug, Clone)]
struct Write {
    column: &'static str,
    value: Value,
    physical_ms: u64,
    device: u8,
}

fn write_strategy() -> impl Strategy<Value = Write> {
    (0..COLUMNS.len(), any::<i64>(), any::<bool>(), 0u64..50, 0u8..3).prop_map(
        |(column, number, flag, physical_ms, device)| {
            let column = COLUMNS[column];
            let value = if column == TOMBSTONE_COLUMN { Value::Bool(flag) } else { json!(number) };
            Write { column, value, physical_ms, device }
        },
    )
}

fn stamped(writes: Vec<Write>) -> Vec<(String, Value, Hlc)> {
    writes
        .into_iter()
        .enumerate()
        .map(|(n, w)| {
            let hlc = Hlc::new(w.physical_ms, n as u32, device(w.device));
            (w.column.to_string(), w.value, hlc)
        })
        .collect()
}

/// A history and a shuffled copy of it.
fn history_and_permutation() -> impl Strategy<Value = (Vec<(String, Value, Hlc)>, Vec<(String, Value, Hlc)>)> {
    prop::collection::vec(write_strategy(), 1..40).prop_flat_map(|writes| {
        let history = stamped(writes);
        let shuffled = Just(history.clone()).prop_shuffle();
        (Just(history), shuffled)
    })
}

fn hlc_strategy() -> impl Strategy<Value = Hlc> {
    (any::<u64>(), any::<u32>(), any::<[u8; 16]>())
        .prop_map(|(physical_ms, counter, bytes)| Hlc::new(physical_ms, counter, Uuid::from_bytes(bytes)))
}

/// Generate arbitrary JSON values (including invalid structures)
fn arbitrary_json_strategy() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(|n| Value::Number(n.into())),
        ".*".prop_map(Value::String),
    ];

    leaf.prop_recursive(
        4,   // depth
        64,  // max nodes
        10,  // items per collection
        |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..10).prop_map(Value::Array),
                prop::collection::hash_map(".*", inner, 0..10)
                    .prop_map(|m| Value::Object(m.into_iter().collect())),
            ]
        },
    )
}

fn merge_all(id: Uuid, writes: &[(String, Value, Hlc)]) -> Row {
    let mut row = Row::new(id);
    for (column, value, hlc) in writes {
        row.apply_column(column, value.clone(), *hlc).unwrap();
    }
    row
}

// =============================================================================
// Merge properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// Any delivery order yields the same row.
    #[test]
    fn delivery_order_does_not_matter((history, shuffled) in history_and_permutation()) {
        let id = Uuid::new_v4();
        let in_order = merge_all(id, &history);
        let out_of_order = merge_all(id, &shuffled);

        prop_assert_eq!(&in_order, &out_of_order);
        prop_assert_eq!(in_order.is_deleted(), out_of_order.is_deleted());
        prop_assert!(in_order.is_consistent());
    }

    /// Each column holds the value of its highest-stamped write.
    #[test]
    fn highest_stamp_wins_per_column((history, shuffled) in history_and_permutation()) {
        let row = merge_all(Uuid::new_v4(), &shuffled);
        for column in COLUMNS {
            let winner = history
                .iter()
                .filter(|(c, _, _)| c == column)
                .max_by_key(|(_, _, hlc)| *hlc);
            match winner {
                Some((_, value, hlc)) => {
                    let merged_value = row.value(column);
                    prop_assert_eq!(merged_value.as_ref(), Some(value));
                    prop_assert_eq!(row.column_hlc(column), Some(hlc));
                }
                None => prop_assert!(row.column_hlc(column).is_none()),
            }
        }
        prop_assert_eq!(row.row_timestamp, history.iter().map(|(_, _, hlc)| *hlc).max());
    }

    /// Delivering every write a second time changes nothing.
    #[test]
    fn duplicate_delivery_is_idempotent((history, shuffled) in history_and_permutation()) {
        let mut row = merge_all(Uuid::new_v4(), &history);
        let before = row.clone();
        for (column, value, hlc) in shuffled {
            prop_assert!(!row.apply_column(&column, value, hlc).unwrap());
        }
        prop_assert_eq!(row, before);
    }
}

// =============================================================================
// Parsing never panics
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(500))]

    #[test]
    fn hlc_parse_never_panics(input in ".*") {
        let _ = Hlc::from_str(&input);
    }

    #[test]
    fn hlc_parse_of_near_miss_never_panics(
        physical in "[0-9a-fA-F+-]{0,20}",
        counter in "[0-9a-fA-F+-]{0,10}",
        device in "[0-9a-fA-F{}-]{0,40}",
    ) {
        let _ = Hlc::from_str(&format!("{physical}-{counter}-{device}"));
    }

    /// Canonical strings round-trip and sort exactly like the stamps.
    #[test]
    fn hlc_string_order_matches_stamp_order(a in hlc_strategy(), b in hlc_strategy()) {
        let (sa, sb) = (a.to_string(), b.to_string());
        prop_assert_eq!(Hlc::from_str(&sa).unwrap(), a);
        prop_assert_eq!(sa.cmp(&sb), a.cmp(&b));
    }

    #[test]
    fn column_change_parse_never_panics(value in arbitrary_json_strategy()) {
        let _ = serde_json::from_value::<ColumnChange>(value);
    }

    #[test]
    fn column_change_parse_of_bytes_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..512)) {
        let _ = serde_json::from_slice::<ColumnChange>(&bytes);
    }

    /// Well-formed records with a corrupted stamp are rejected, not accepted.
    #[test]
    fn column_change_with_bad_stamp_is_rejected(stamp in "[g-z]{1,40}") {
        let record = json!({
            "table": "notes",
            "rowPk": Uuid::nil().to_string(),
            "columnName": "title",
            "hlcTimestamp": stamp,
            "deviceId": Uuid::nil().to_string(),
            "encryptedValue": "00",
            "nonce": "00",
            "batchId": "b",
            "batchSeq": 0,
            "batchTotal": 1,
        });
        prop_assert!(serde_json::from_value::<ColumnChange>(record).is_err());
    }
}
