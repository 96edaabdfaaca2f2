//! Persistent state shapes tracked per watched file and per sync run.
//!
//! Field names mirror the external SQL schema in spec.md §6 exactly
//! (`dbf_file_state`/`sync_log` columns), since `SqlStateStore` serializes
//! these structs almost 1:1 into that schema.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::core::ChecksumMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessingStatus {
    Pending,
    Processing,
    Completed,
    Error,
}

impl fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProcessingStatus::Pending => "PENDING",
            ProcessingStatus::Processing => "PROCESSING",
            ProcessingStatus::Completed => "COMPLETED",
            ProcessingStatus::Error => "ERROR",
        };
        f.write_str(s)
    }
}

impl FromStr for ProcessingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(ProcessingStatus::Pending),
            "PROCESSING" => Ok(ProcessingStatus::Processing),
            "COMPLETED" => Ok(ProcessingStatus::Completed),
            "ERROR" => Ok(ProcessingStatus::Error),
            other => Err(format!("unknown processing status: {other}")),
        }
    }
}

/// Durable record of what a watched DBF file looked like the last time it
/// was synced: its checksum snapshot, record count, and lease state.
/// Mirrors `dbf_file_state` (spec.md §6) column for column.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileState {
    pub file_path: String,
    pub file_name: String,
    pub processing_status: ProcessingStatus,
    pub checksum_map: ChecksumMap,
    pub record_count: usize,
    /// Source file mtime as of the last successful sync.
    pub last_modified: Option<DateTime<Utc>>,
    /// When the last sync attempt (successful or not) completed.
    pub last_processed: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl FileState {
    pub fn new(file_path: impl Into<String>, file_name: impl Into<String>) -> Self {
        Self {
            file_path: file_path.into(),
            file_name: file_name.into(),
            processing_status: ProcessingStatus::Pending,
            checksum_map: BTreeMap::new(),
            record_count: 0,
            last_modified: None,
            last_processed: None,
            error_message: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationType {
    Update,
    BulkLoad,
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OperationType::Update => "UPDATE",
            OperationType::BulkLoad => "BULK_LOAD",
        };
        f.write_str(s)
    }
}

/// One audit entry appended after each sync attempt, successful or not.
/// Mirrors `sync_log` (spec.md §6) column for column: `record_count` is the
/// size of the file's current checksum snapshot, `records_processed` is how
/// many of its records were actually written to the target table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncLogEntry {
    pub file_path: String,
    pub table_name: String,
    pub operation_type: OperationType,
    pub record_count: usize,
    pub records_processed: usize,
    pub duration_ms: u64,
    pub success: bool,
    pub error_message: Option<String>,
    pub timestamp: DateTime<Utc>,
}
