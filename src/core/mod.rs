//! Low-level handling of xBase/FoxPro `.DBF` tables and their memo sidecars.
//!
//! - `reader`: header decoding, field descriptors, checksum snapshots, record streaming.
//! - `memo`: `.DBT`/`.FPT` sidecar lookup for memo (`M`) fields.
//! - `delta`: pure checksum-map diffing (insert/update/delete classification).
//!
//! Exports:
//! - `DbfReader`, `DbfHeader`, `FieldDescriptor`, `FieldKind`: table structure and reading.
//! - `ChecksumMap`: record index -> CRC-32 snapshot used for change detection.
//! - `MemoReader`, `MemoKind`: sidecar access.
//! - `compute_deltas`, `Delta`: the CDC diff.

pub mod delta;
pub mod memo;
pub mod reader;

pub use delta::{compute_deltas, Delta};
pub use memo::{MemoKind, MemoReader};
pub use reader::{ChecksumMap, DbfHeader, DbfReadError, DbfReader, FieldDescriptor, FieldKind};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A single decoded value for one field of one record.
///
/// Deliberately small and primitive-only: the core treats a record as an
/// attribute map and leaves column-level validation to the SQL driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Text(String),
    Integer(i64),
    Decimal(f64),
    Date(chrono::NaiveDate),
    Boolean(bool),
    Null,
}

impl FieldValue {
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }
}

/// One decoded DBF record: upper-cased field name -> value, in file order.
pub type DomainRow = BTreeMap<String, FieldValue>;
