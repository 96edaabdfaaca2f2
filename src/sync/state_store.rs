//! The `StateStore` boundary: everything the sync engine needs to persist,
//! expressed as an async trait so the engine stays testable without a real
//! database.
//!
//! `SqlStateStore` is the production implementation, backed by `sqlx`'s
//! backend-agnostic `AnyPool` so the same binary can point at Postgres,
//! MySQL, or SQLite by changing `DATABASE_URL`'s scheme. `InMemoryStateStore`
//! is a plain in-process implementation used by tests and by `dbfsync scan`.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::any::{install_default_drivers, AnyPoolOptions};
use sqlx::{Any, AnyPool, Transaction};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;

use crate::core::DomainRow;
use crate::sync::engine::{apply_upsert_sql, TargetTable};
use crate::sync::models::{FileState, OperationType, ProcessingStatus, SyncLogEntry};

#[derive(Debug, Error)]
pub enum StateStoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("file state for '{0}' is not in PROCESSING status, refusing to complete it")]
    NotProcessing(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StateStoreError>;

/// Persistence boundary used by `sync::engine::SyncEngine`.
///
/// Every method is keyed by `file_path` as the natural identifier of a
/// watched table, matching the one-state-row-per-file model described for
/// the watcher.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Returns the existing state for `file_path`, or a fresh `Pending`
    /// state if this file has never been seen before.
    async fn get_or_create_file_state(&self, file_path: &str, file_name: &str) -> Result<FileState>;

    /// Transitions a file to `Processing`. Acts as an exclusive lease: two
    /// concurrent callers for the same file must not both succeed for the
    /// engine's "serialize same-file processing" invariant to hold, though
    /// the trait itself only defines the state transition, not the locking
    /// strategy (the watcher's in-flight set provides that).
    async fn begin_processing(&self, file_path: &str) -> Result<()>;

    /// Records a successful sync: new checksum map, record count, and
    /// modification timestamp, and moves the file back to `Completed`.
    async fn complete_sync(
        &self,
        file_path: &str,
        checksum_map: &crate::core::ChecksumMap,
        record_count: usize,
        last_modified: chrono::DateTime<Utc>,
    ) -> Result<()>;

    /// Records a failed sync attempt: moves the file to `Error` and stores
    /// the failure message, leaving the previous checksum map untouched so
    /// the next attempt retries against the last known-good snapshot.
    async fn fail_sync(&self, file_path: &str, error_message: &str) -> Result<()>;

    /// Appends an audit entry for one sync attempt.
    async fn append_sync_log(&self, entry: SyncLogEntry) -> Result<()>;

    /// Opens a transaction scoped to one file's (or one bulk-load batch's)
    /// worth of upserts. All rows applied through it become visible
    /// together on `commit`, or not at all if the caller drops it.
    async fn begin_sync_transaction(&self) -> Result<Box<dyn SyncTransaction>>;
}

/// A unit-of-work boundary for applying a group of row upserts atomically.
/// Dropping it without calling `commit` leaves no trace.
#[async_trait]
pub trait SyncTransaction: Send {
    async fn upsert_row(&mut self, table: TargetTable, row: &DomainRow) -> Result<()>;
    async fn commit(self: Box<Self>) -> Result<()>;
}

pub struct SqlStateStore {
    pool: AnyPool,
}

impl SqlStateStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        install_default_drivers();
        let pool = AnyPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }
}

#[async_trait]
impl StateStore for SqlStateStore {
    async fn get_or_create_file_state(&self, file_path: &str, file_name: &str) -> Result<FileState> {
        let row = sqlx::query_as::<_, FileStateRow>(
            "SELECT file_path, file_name, processing_status, checksum_map, record_count, \
             last_modified, last_processed, error_message \
             FROM dbf_file_state WHERE file_path = $1",
        )
        .bind(file_path)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row.into_file_state(),
            None => {
                let state = FileState::new(file_path, file_name);
                sqlx::query(
                    "INSERT INTO dbf_file_state \
                     (file_path, file_name, processing_status, checksum_map, record_count, \
                      last_modified, last_processed, error_message) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
                )
                .bind(&state.file_path)
                .bind(&state.file_name)
                .bind(state.processing_status.to_string())
                .bind(serde_json::to_string(&state.checksum_map)?)
                .bind(state.record_count as i64)
                .bind(state.last_modified)
                .bind(state.last_processed)
                .bind(&state.error_message)
                .execute(&self.pool)
                .await?;
                Ok(state)
            }
        }
    }

    async fn begin_processing(&self, file_path: &str) -> Result<()> {
        sqlx::query("UPDATE dbf_file_state SET processing_status = $1 WHERE file_path = $2")
            .bind(ProcessingStatus::Processing.to_string())
            .bind(file_path)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn complete_sync(
        &self,
        file_path: &str,
        checksum_map: &crate::core::ChecksumMap,
        record_count: usize,
        last_modified: chrono::DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE dbf_file_state \
             SET processing_status = $1, checksum_map = $2, record_count = $3, last_modified = $4, \
                 last_processed = $5, error_message = NULL \
             WHERE file_path = $6",
        )
        .bind(ProcessingStatus::Completed.to_string())
        .bind(serde_json::to_string(checksum_map)?)
        .bind(record_count as i64)
        .bind(last_modified)
        .bind(Utc::now())
        .bind(file_path)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fail_sync(&self, file_path: &str, error_message: &str) -> Result<()> {
        sqlx::query(
            "UPDATE dbf_file_state SET processing_status = $1, error_message = $2, last_processed = $3 \
             WHERE file_path = $4",
        )
        .bind(ProcessingStatus::Error.to_string())
        .bind(error_message)
        .bind(Utc::now())
        .bind(file_path)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn append_sync_log(&self, entry: SyncLogEntry) -> Result<()> {
        sqlx::query(
            "INSERT INTO sync_log \
             (id, file_path, table_name, operation_type, record_count, records_processed, \
              duration_ms, success, error_message, timestamp) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(sync_log_id())
        .bind(&entry.file_path)
        .bind(&entry.table_name)
        .bind(entry.operation_type.to_string())
        .bind(entry.record_count as i64)
        .bind(entry.records_processed as i64)
        .bind(entry.duration_ms as i64)
        .bind(entry.success)
        .bind(&entry.error_message)
        .bind(entry.timestamp)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn begin_sync_transaction(&self) -> Result<Box<dyn SyncTransaction>> {
        let txn = self.pool.begin().await?;
        Ok(Box::new(SqlSyncTransaction { txn: Some(txn) }))
    }
}

/// Timestamps are nanosecond-resolution and monotonic enough in practice to
/// serve as a portable primary key across Postgres/MySQL/SQLite, none of
/// which the `Any` driver lets us address with a single autoincrement
/// syntax.
fn sync_log_id() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or_else(|| Utc::now().timestamp())
}

struct SqlSyncTransaction {
    txn: Option<Transaction<'static, Any>>,
}

#[async_trait]
impl SyncTransaction for SqlSyncTransaction {
    async fn upsert_row(&mut self, table: TargetTable, row: &DomainRow) -> Result<()> {
        let txn = self.txn.as_mut().expect("upsert_row called after commit");
        apply_upsert_sql(&mut **txn, table, row).await
    }

    async fn commit(mut self: Box<Self>) -> Result<()> {
        let txn = self.txn.take().expect("commit called twice");
        txn.commit().await?;
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct FileStateRow {
    file_path: String,
    file_name: String,
    processing_status: String,
    checksum_map: String,
    record_count: i64,
    last_modified: Option<chrono::DateTime<Utc>>,
    last_processed: Option<chrono::DateTime<Utc>>,
    error_message: Option<String>,
}

impl FileStateRow {
    fn into_file_state(self) -> Result<FileState> {
        Ok(FileState {
            file_path: self.file_path,
            file_name: self.file_name,
            processing_status: self.processing_status.parse().unwrap_or(ProcessingStatus::Pending),
            checksum_map: serde_json::from_str(&self.checksum_map)?,
            record_count: self.record_count as usize,
            last_modified: self.last_modified,
            last_processed: self.last_processed,
            error_message: self.error_message,
        })
    }
}

/// In-process `StateStore` used by tests and by read-only CLI commands that
/// never need a real database.
#[derive(Default)]
pub struct InMemoryStateStore {
    states: Mutex<HashMap<String, FileState>>,
    logs: Mutex<Vec<SyncLogEntry>>,
    rows: Arc<Mutex<HashMap<&'static str, Vec<DomainRow>>>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn logs(&self) -> Vec<SyncLogEntry> {
        self.logs.lock().unwrap().clone()
    }

    pub fn rows_for(&self, table: TargetTable) -> Vec<DomainRow> {
        self.rows
            .lock()
            .unwrap()
            .get(table.as_str())
            .cloned()
            .unwrap_or_default()
    }
}

/// Applies one upsert to the shared row map, matching on natural key when
/// the table has one. Shared by the in-memory transaction's `commit` and
/// anything that wants the dedupe behavior without a transaction wrapper.
fn apply_in_memory_upsert(
    rows: &mut HashMap<&'static str, Vec<DomainRow>>,
    table: TargetTable,
    row: DomainRow,
) {
    let bucket = rows.entry(table.as_str()).or_default();
    if let Some(key_field) = table.natural_key() {
        if let Some(key_value) = row.get(key_field) {
            if let Some(existing) = bucket
                .iter_mut()
                .find(|existing| existing.get(key_field) == Some(key_value))
            {
                *existing = row;
                return;
            }
        }
    }
    bucket.push(row);
}

struct InMemorySyncTransaction {
    rows: Arc<Mutex<HashMap<&'static str, Vec<DomainRow>>>>,
    pending: Vec<(TargetTable, DomainRow)>,
}

#[async_trait]
impl SyncTransaction for InMemorySyncTransaction {
    async fn upsert_row(&mut self, table: TargetTable, row: &DomainRow) -> Result<()> {
        self.pending.push((table, row.clone()));
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let mut rows = self.rows.lock().unwrap();
        for (table, row) in self.pending {
            apply_in_memory_upsert(&mut rows, table, row);
        }
        Ok(())
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn get_or_create_file_state(&self, file_path: &str, file_name: &str) -> Result<FileState> {
        let mut states = self.states.lock().unwrap();
        Ok(states
            .entry(file_path.to_string())
            .or_insert_with(|| FileState::new(file_path, file_name))
            .clone())
    }

    async fn begin_processing(&self, file_path: &str) -> Result<()> {
        let mut states = self.states.lock().unwrap();
        let state = states
            .entry(file_path.to_string())
            .or_insert_with(|| FileState::new(file_path, file_path));
        state.processing_status = ProcessingStatus::Processing;
        Ok(())
    }

    async fn complete_sync(
        &self,
        file_path: &str,
        checksum_map: &crate::core::ChecksumMap,
        record_count: usize,
        last_modified: chrono::DateTime<Utc>,
    ) -> Result<()> {
        let mut states = self.states.lock().unwrap();
        let state = states
            .entry(file_path.to_string())
            .or_insert_with(|| FileState::new(file_path, file_path));
        if state.processing_status != ProcessingStatus::Processing {
            return Err(StateStoreError::NotProcessing(file_path.to_string()));
        }
        state.processing_status = ProcessingStatus::Completed;
        state.checksum_map = checksum_map.clone();
        state.record_count = record_count;
        state.last_modified = Some(last_modified);
        state.last_processed = Some(Utc::now());
        state.error_message = None;
        Ok(())
    }

    async fn fail_sync(&self, file_path: &str, error_message: &str) -> Result<()> {
        let mut states = self.states.lock().unwrap();
        let state = states
            .entry(file_path.to_string())
            .or_insert_with(|| FileState::new(file_path, file_path));
        state.processing_status = ProcessingStatus::Error;
        state.error_message = Some(error_message.to_string());
        state.last_processed = Some(Utc::now());
        Ok(())
    }

    async fn append_sync_log(&self, entry: SyncLogEntry) -> Result<()> {
        self.logs.lock().unwrap().push(entry);
        Ok(())
    }

    async fn begin_sync_transaction(&self) -> Result<Box<dyn SyncTransaction>> {
        Ok(Box::new(InMemorySyncTransaction {
            rows: self.rows.clone(),
            pending: Vec::new(),
        }))
    }
}
