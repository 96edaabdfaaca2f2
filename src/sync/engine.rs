//! The per-file sync algorithm: diff a table's current checksums against
//! its last known snapshot, classify the file into a domain table, and
//! apply inserts/updates inside a single transaction per file. Physical
//! deletes are logged but never executed against the target database —
//! source tables are the only writer of record for row removal.

use std::path::Path;
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{info, warn};

use crate::core::{compute_deltas, DbfReadError, DbfReader, DomainRow, FieldValue};
use crate::sync::models::{OperationType, SyncLogEntry};
use crate::sync::state_store::{StateStore, StateStoreError};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("failed to read DBF file: {0}")]
    Dbf(#[from] DbfReadError),
    #[error("state store error: {0}")]
    Store(#[from] StateStoreError),
    #[error("could not determine target table for file '{0}'")]
    UnknownTable(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SyncError>;

/// The three domain tables a watched DBF file can map to. Any file whose
/// name doesn't match one of these is outside the watched set entirely and
/// never reaches the sync engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetTable {
    Customer,
    Product,
    Movement,
}

impl TargetTable {
    pub fn as_str(self) -> &'static str {
        match self {
            TargetTable::Customer => "customers",
            TargetTable::Product => "products",
            TargetTable::Movement => "movements",
        }
    }

    /// The field (already normalized to lower case) used as the natural
    /// key for upsert matching. Movements are append-only and have none.
    pub fn natural_key(self) -> Option<&'static str> {
        match self {
            TargetTable::Customer => Some("numcli"),
            TargetTable::Product => Some("numart"),
            TargetTable::Movement => None,
        }
    }

    /// Classifies a watched file by its base name, case-insensitively.
    pub fn from_file_name(file_name: &str) -> Option<Self> {
        match file_name.to_lowercase().as_str() {
            "clientes.dbf" => Some(TargetTable::Customer),
            "arts.dbf" => Some(TargetTable::Product),
            "movim.dbf" => Some(TargetTable::Movement),
            _ => None,
        }
    }
}

/// The file names the watcher and the initial scan restrict themselves to.
pub const WATCHED_FILE_NAMES: &[&str] = &["clientes.dbf", "arts.dbf", "movim.dbf"];

/// Lower-cases a DBF field name, applying the one-off renames product rows
/// need to avoid colliding with SQL reserved words (`DESC`) or carrying an
/// ambiguous legacy name (`SERIES`).
pub fn normalize_field_name(table: TargetTable, field_name: &str) -> String {
    let lower = field_name.to_lowercase();
    if table == TargetTable::Product {
        match lower.as_str() {
            "desc" => "desc_product".to_string(),
            "series" => "series_control".to_string(),
            _ => lower,
        }
    } else {
        lower
    }
}

/// Renames a decoded record's fields per `normalize_field_name` and trims
/// empty text values down to `Null` so a blank fixed-width field doesn't
/// become an empty string in the target table.
fn normalize_row(table: TargetTable, raw: DomainRow) -> DomainRow {
    raw.into_iter()
        .map(|(name, value)| {
            let value = match value {
                FieldValue::Text(text) if text.trim().is_empty() => FieldValue::Null,
                FieldValue::Text(text) => FieldValue::Text(text.trim().to_string()),
                other => other,
            };
            (normalize_field_name(table, &name), value)
        })
        .collect()
}

/// `true` if the row's natural key (if the table has one) is present and
/// non-empty. Rows failing this check are skipped rather than upserted,
/// since an empty key can't identify a unique target row.
fn has_usable_key(table: TargetTable, row: &DomainRow) -> bool {
    match table.natural_key() {
        None => true,
        Some(key) => matches!(row.get(key), Some(value) if !value.is_null()),
    }
}

/// Merges insert and update indices into one ascending-ordered sequence.
/// Applying them as a single pass (rather than all inserts, then all
/// updates) keeps row application in source record order, per the delta
/// detector's documented contract.
fn merged_apply_order(inserts: &[u32], updates: &[u32]) -> Vec<u32> {
    let mut merged: Vec<u32> = inserts.iter().chain(updates.iter()).copied().collect();
    merged.sort_unstable();
    merged
}

pub struct SyncOutcome {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
    pub changed: bool,
}

pub struct SyncEngine {
    store: Arc<dyn StateStore>,
}

impl SyncEngine {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    /// Runs the full per-file CDC cycle described in the module docs. Any
    /// failure *after* the file is recognized as watched is recorded
    /// against its state (status `Error` plus a failed `SyncLogEntry`)
    /// before being returned to the caller. A file that isn't one of the
    /// watched tables is rejected before touching the store at all — it
    /// never gets a state row or a log entry.
    pub async fn process_dbf_file(&self, path: &Path) -> Result<SyncOutcome> {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let table = TargetTable::from_file_name(&file_name)
            .ok_or_else(|| SyncError::UnknownTable(file_name.clone()))?;

        let file_key = file_key(path);
        let started = Instant::now();
        match self
            .process_dbf_file_inner(path, &file_key, &file_name, table, started)
            .await
        {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                self.store.fail_sync(&file_key, &err.to_string()).await?;
                self.store
                    .append_sync_log(SyncLogEntry {
                        file_path: file_key.clone(),
                        table_name: table.as_str().to_string(),
                        operation_type: OperationType::Update,
                        record_count: 0,
                        records_processed: 0,
                        duration_ms: started.elapsed().as_millis() as u64,
                        success: false,
                        error_message: Some(err.to_string()),
                        timestamp: Utc::now(),
                    })
                    .await?;
                Err(err)
            }
        }
    }

    async fn process_dbf_file_inner(
        &self,
        path: &Path,
        file_key: &str,
        file_name: &str,
        table: TargetTable,
        started: Instant,
    ) -> Result<SyncOutcome> {
        let state = self.store.get_or_create_file_state(file_key, file_name).await?;
        self.store.begin_processing(file_key).await?;

        let reader = DbfReader::open(path)?;
        let current_checksums = reader.compute_record_checksums()?;
        let delta = compute_deltas(&state.checksum_map, &current_checksums);

        if !delta.has_changes() {
            self.store
                .complete_sync(
                    file_key,
                    &current_checksums,
                    current_checksums.len(),
                    last_modified(path)?,
                )
                .await?;
            return Ok(SyncOutcome {
                inserted: 0,
                updated: 0,
                deleted: 0,
                changed: false,
            });
        }

        for index in &delta.deletes {
            warn!(
                file = file_key,
                record_index = index,
                "record removed from source table, not deleting from target (physical deletes are not propagated)"
            );
        }

        let apply_order = merged_apply_order(&delta.inserts, &delta.updates);
        let mut applied = 0usize;
        let mut txn = self.store.begin_sync_transaction().await?;
        for index in &apply_order {
            let raw_row = reader.read_record(*index)?;
            let row = normalize_row(table, raw_row);
            if !has_usable_key(table, &row) {
                continue;
            }
            txn.upsert_row(table, &row).await?;
            applied += 1;
        }
        txn.commit().await?;

        let inserted = delta.inserts.len();
        let updated = delta.updates.len();

        self.store
            .complete_sync(
                file_key,
                &current_checksums,
                current_checksums.len(),
                last_modified(path)?,
            )
            .await?;

        self.store
            .append_sync_log(SyncLogEntry {
                file_path: file_key.to_string(),
                table_name: table.as_str().to_string(),
                operation_type: OperationType::Update,
                record_count: current_checksums.len(),
                records_processed: applied,
                duration_ms: started.elapsed().as_millis() as u64,
                success: true,
                error_message: None,
                timestamp: Utc::now(),
            })
            .await?;

        info!(file = file_key, %inserted, %updated, deleted = delta.deletes.len(), applied, "synced");

        Ok(SyncOutcome {
            inserted,
            updated,
            deleted: delta.deletes.len(),
            changed: true,
        })
    }

    /// Loads every record of a file unconditionally, ignoring whatever
    /// checksum snapshot (if any) is on record. Used for first-time seeding
    /// of a large table. Commits once per batch of `BATCH_SIZE` records
    /// rather than once for the whole file, so a failure partway through a
    /// very large table doesn't force re-applying everything already
    /// written on retry.
    pub async fn bulk_load_file(&self, path: &Path) -> Result<usize> {
        const BATCH_SIZE: usize = 1000;

        let started = Instant::now();
        let file_key = file_key(path);
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let table = TargetTable::from_file_name(&file_name)
            .ok_or_else(|| SyncError::UnknownTable(file_name.clone()))?;

        self.store.begin_processing(&file_key).await?;

        let reader = DbfReader::open(path)?;
        let mut total = 0usize;
        let mut applied = 0usize;
        let mut batch = Vec::with_capacity(BATCH_SIZE);

        for record in reader.read_all_records()?.into_iter() {
            let row = normalize_row(table, record?);
            if has_usable_key(table, &row) {
                batch.push(row);
            }
            total += 1;
            if batch.len() >= BATCH_SIZE {
                applied += self.apply_batch(table, std::mem::take(&mut batch)).await?;
            }
        }
        if !batch.is_empty() {
            applied += self.apply_batch(table, batch).await?;
        }

        let checksum_map = reader.compute_record_checksums()?;
        self.store
            .complete_sync(&file_key, &checksum_map, total, last_modified(path)?)
            .await?;
        self.store
            .append_sync_log(SyncLogEntry {
                file_path: file_key,
                table_name: table.as_str().to_string(),
                operation_type: OperationType::BulkLoad,
                record_count: total,
                records_processed: applied,
                duration_ms: started.elapsed().as_millis() as u64,
                success: true,
                error_message: None,
                timestamp: Utc::now(),
            })
            .await?;

        Ok(total)
    }

    async fn apply_batch(&self, table: TargetTable, batch: Vec<DomainRow>) -> Result<usize> {
        let mut txn = self.store.begin_sync_transaction().await?;
        for row in &batch {
            txn.upsert_row(table, row).await?;
        }
        txn.commit().await?;
        Ok(batch.len())
    }
}

fn file_key(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

fn last_modified(path: &Path) -> Result<DateTime<Utc>> {
    let metadata = std::fs::metadata(path)?;
    let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
    Ok(DateTime::<Utc>::from(modified))
}

/// Upserts a row into its SQL table by natural key, or appends it if the
/// table has none (movements). Generic over the executor so the same SQL
/// text serves both a bare pool and an open transaction.
pub(crate) async fn apply_upsert_sql<'c, E>(
    executor: E,
    table: TargetTable,
    row: &DomainRow,
) -> crate::sync::state_store::Result<()>
where
    E: sqlx::Executor<'c, Database = sqlx::Any>,
{
    let columns: Vec<&str> = row.keys().map(|k| k.as_str()).collect();
    let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("${i}")).collect();

    let mut query = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        table.as_str(),
        columns.join(", "),
        placeholders.join(", ")
    );

    if let Some(key) = table.natural_key() {
        let assignments: Vec<String> = columns
            .iter()
            .filter(|c| **c != key)
            .map(|c| format!("{c} = EXCLUDED.{c}"))
            .collect();
        query.push_str(&format!(
            " ON CONFLICT ({key}) DO UPDATE SET {}",
            assignments.join(", ")
        ));
    }

    let mut statement = sqlx::query(&query);
    for name in &columns {
        let value = row.get(*name).expect("column came from row.keys()");
        statement = bind_field_value(statement, value);
    }
    statement.execute(executor).await?;
    Ok(())
}

fn bind_field_value<'q>(
    query: sqlx::query::Query<'q, sqlx::Any, sqlx::any::AnyArguments<'q>>,
    value: &'q FieldValue,
) -> sqlx::query::Query<'q, sqlx::Any, sqlx::any::AnyArguments<'q>> {
    match value {
        FieldValue::Text(s) => query.bind(s.as_str()),
        FieldValue::Integer(i) => query.bind(*i),
        FieldValue::Decimal(d) => query.bind(*d),
        FieldValue::Date(d) => query.bind(d.to_string()),
        FieldValue::Boolean(b) => query.bind(*b),
        FieldValue::Null => query.bind(Option::<String>::None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_target_tables_by_file_name_case_insensitively() {
        assert_eq!(
            TargetTable::from_file_name("CLIENTES.DBF"),
            Some(TargetTable::Customer)
        );
        assert_eq!(TargetTable::from_file_name("arts.dbf"), Some(TargetTable::Product));
        assert_eq!(TargetTable::from_file_name("movim.dbf"), Some(TargetTable::Movement));
        assert_eq!(TargetTable::from_file_name("other.dbf"), None);
    }

    #[test]
    fn product_field_renames_are_applied() {
        assert_eq!(normalize_field_name(TargetTable::Product, "DESC"), "desc_product");
        assert_eq!(normalize_field_name(TargetTable::Product, "SERIES"), "series_control");
        assert_eq!(normalize_field_name(TargetTable::Product, "NUMART"), "numart");
    }

    #[test]
    fn customer_fields_are_only_lower_cased() {
        assert_eq!(normalize_field_name(TargetTable::Customer, "NAME"), "name");
    }

    #[test]
    fn blank_text_fields_become_null() {
        let mut row = DomainRow::new();
        row.insert("NUMCLI".to_string(), FieldValue::Text("C1".to_string()));
        row.insert("NOTE".to_string(), FieldValue::Text("   ".to_string()));
        let normalized = normalize_row(TargetTable::Customer, row);
        assert_eq!(normalized.get("note"), Some(&FieldValue::Null));
    }

    #[test]
    fn rows_without_a_usable_key_are_rejected() {
        let mut row = DomainRow::new();
        row.insert("numcli".to_string(), FieldValue::Null);
        assert!(!has_usable_key(TargetTable::Customer, &row));

        row.insert("numcli".to_string(), FieldValue::Text("C1".to_string()));
        assert!(has_usable_key(TargetTable::Customer, &row));
    }

    #[test]
    fn movements_have_no_natural_key_requirement() {
        let row = DomainRow::new();
        assert!(has_usable_key(TargetTable::Movement, &row));
    }

    #[test]
    fn merged_apply_order_interleaves_and_sorts_inserts_and_updates() {
        let inserts = vec![4, 1];
        let updates = vec![3, 2];
        assert_eq!(merged_apply_order(&inserts, &updates), vec![1, 2, 3, 4]);
    }
}
