//! End-to-end coverage of the reader -> delta -> sync path against a
//! synthetic `clientes.dbf`, using `InMemoryStateStore` so no database is
//! needed.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use dbfsync_engine::core::FieldValue;
use dbfsync_engine::sync::{InMemoryStateStore, StateStore, SyncEngine, TargetTable};

const RECORD_LEN: u16 = 1 + 10 + 10; // deletion flag + NUMCLI(10) + NOMCLI(10)

fn write_clientes_dbf(path: &Path, records: &[(&str, &str)]) {
    let mut header = Vec::new();
    header.push(0x03); // dBase III, no memo
    header.extend_from_slice(&[0u8; 3]);
    header.extend_from_slice(&(records.len() as u32).to_le_bytes());
    header.extend_from_slice(&(32u16 + 32 * 2 + 1).to_le_bytes());
    header.extend_from_slice(&RECORD_LEN.to_le_bytes());
    header.extend_from_slice(&[0u8; 20]);

    write_field(&mut header, "NUMCLI", 10);
    write_field(&mut header, "NOMCLI", 10);
    header.push(0x0D);

    let mut file = std::fs::File::create(path).unwrap();
    file.write_all(&header).unwrap();
    for (numcli, nomcli) in records {
        file.write_all(b" ").unwrap();
        file.write_all(&pad(numcli, 10)).unwrap();
        file.write_all(&pad(nomcli, 10)).unwrap();
    }
    file.flush().unwrap();
}

fn write_field(buf: &mut Vec<u8>, name: &str, length: u8) {
    let mut name_bytes = [0u8; 11];
    let bytes = name.as_bytes();
    name_bytes[..bytes.len()].copy_from_slice(bytes);
    buf.extend_from_slice(&name_bytes);
    buf.push(b'C');
    buf.extend_from_slice(&[0u8; 4]);
    buf.push(length);
    buf.push(0);
    buf.extend_from_slice(&[0u8; 14]);
}

fn pad(s: &str, len: usize) -> Vec<u8> {
    let mut bytes = s.as_bytes().to_vec();
    bytes.resize(len, b' ');
    bytes
}

#[tokio::test]
async fn first_sight_file_inserts_all_records() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("clientes.dbf");
    write_clientes_dbf(&path, &[("C001", "A"), ("C002", "B"), ("C003", "C")]);

    let store = Arc::new(InMemoryStateStore::new());
    let engine = SyncEngine::new(store.clone());

    let outcome = engine.process_dbf_file(&path).await.unwrap();
    assert!(outcome.changed);
    assert_eq!(outcome.inserted, 3);
    assert_eq!(outcome.updated, 0);
    assert_eq!(outcome.deleted, 0);

    let state = store
        .get_or_create_file_state(&path.to_string_lossy(), "clientes.dbf")
        .await
        .unwrap();
    assert_eq!(state.record_count, 3);
    assert_eq!(state.checksum_map.len(), 3);

    let logs = store.logs();
    assert_eq!(logs.len(), 1);
    assert!(logs[0].success);
    assert_eq!(logs[0].records_processed, 3);
    assert_eq!(logs[0].table_name, "customers");

    let rows = store.rows_for(TargetTable::Customer);
    assert_eq!(rows.len(), 3);
}

#[tokio::test]
async fn pure_update_produces_a_single_update() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("clientes.dbf");
    write_clientes_dbf(&path, &[("C001", "A"), ("C002", "B"), ("C003", "C")]);

    let store = Arc::new(InMemoryStateStore::new());
    let engine = SyncEngine::new(store.clone());
    engine.process_dbf_file(&path).await.unwrap();

    write_clientes_dbf(&path, &[("C001", "A"), ("C002", "B-RENAMED"), ("C003", "C")]);
    let outcome = engine.process_dbf_file(&path).await.unwrap();

    assert_eq!(outcome.inserted, 0);
    assert_eq!(outcome.updated, 1);
    assert_eq!(outcome.deleted, 0);

    let rows = store.rows_for(TargetTable::Customer);
    let updated_row = rows
        .iter()
        .find(|r| r.get("numcli") == Some(&FieldValue::Text("C002".to_string())))
        .unwrap();
    assert_eq!(
        updated_row.get("nomcli"),
        Some(&FieldValue::Text("B-RENAMED".to_string()))
    );
}

#[tokio::test]
async fn append_inserts_only_the_new_record() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("clientes.dbf");
    write_clientes_dbf(&path, &[("C001", "A"), ("C002", "B"), ("C003", "C")]);

    let store = Arc::new(InMemoryStateStore::new());
    let engine = SyncEngine::new(store.clone());
    engine.process_dbf_file(&path).await.unwrap();

    write_clientes_dbf(
        &path,
        &[("C001", "A"), ("C002", "B"), ("C003", "C"), ("C004", "D")],
    );
    let outcome = engine.process_dbf_file(&path).await.unwrap();

    assert_eq!(outcome.inserted, 1);
    assert_eq!(outcome.updated, 0);
    assert_eq!(outcome.deleted, 0);

    let state = store
        .get_or_create_file_state(&path.to_string_lossy(), "clientes.dbf")
        .await
        .unwrap();
    assert_eq!(state.record_count, 4);
}

#[tokio::test]
async fn physical_delete_shifts_indices_and_is_never_executed_as_a_sql_delete() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("clientes.dbf");
    write_clientes_dbf(
        &path,
        &[("C001", "A"), ("C002", "B"), ("C003", "C"), ("C004", "D")],
    );

    let store = Arc::new(InMemoryStateStore::new());
    let engine = SyncEngine::new(store.clone());
    engine.process_dbf_file(&path).await.unwrap();

    // B removed: file now holds [A, C, D], shifting C and D left by one index.
    write_clientes_dbf(&path, &[("C001", "A"), ("C003", "C"), ("C004", "D")]);
    let outcome = engine.process_dbf_file(&path).await.unwrap();

    assert_eq!(outcome.inserted, 0);
    assert_eq!(outcome.updated, 2); // indices 1 and 2 now hold different records
    assert_eq!(outcome.deleted, 1); // index 3 no longer exists

    // All four rows that were ever upserted remain (delete is logged, not executed).
    let rows = store.rows_for(TargetTable::Customer);
    assert_eq!(rows.len(), 4);
    assert!(rows
        .iter()
        .any(|r| r.get("numcli") == Some(&FieldValue::Text("C002".to_string()))));
}

#[tokio::test]
async fn reprocessing_an_unchanged_file_never_logs_a_second_mutating_run() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("clientes.dbf");
    write_clientes_dbf(&path, &[("C001", "A"), ("C002", "B")]);

    let store = Arc::new(InMemoryStateStore::new());
    let engine = SyncEngine::new(store.clone());

    let first = engine.process_dbf_file(&path).await.unwrap();
    assert!(first.changed);

    let second = engine.process_dbf_file(&path).await.unwrap();
    assert!(!second.changed);
    let third = engine.process_dbf_file(&path).await.unwrap();
    assert!(!third.changed);

    // Only the first run produced an UPDATE sync-log entry.
    assert_eq!(store.logs().len(), 1);
    assert_eq!(store.rows_for(TargetTable::Customer).len(), 2);
}

#[tokio::test]
async fn records_skipped_for_missing_natural_key_are_not_counted_as_processed() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("clientes.dbf");
    write_clientes_dbf(&path, &[("C001", "A"), ("", "B"), ("C003", "C")]);

    let store = Arc::new(InMemoryStateStore::new());
    let engine = SyncEngine::new(store.clone());
    let outcome = engine.process_dbf_file(&path).await.unwrap();

    // Three records are new, but the blank-key one is never upserted.
    assert_eq!(outcome.inserted, 3);
    assert_eq!(store.rows_for(TargetTable::Customer).len(), 2);

    let logs = store.logs();
    assert_eq!(logs[0].records_processed, 2);
}

#[tokio::test]
async fn unwanted_file_name_is_rejected_without_touching_the_store() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("otros.dbf");
    write_clientes_dbf(&path, &[("X001", "Z")]);

    let store = Arc::new(InMemoryStateStore::new());
    let engine = SyncEngine::new(store.clone());

    let result = engine.process_dbf_file(&path).await;
    assert!(result.is_err());
    assert!(store.rows_for(TargetTable::Customer).is_empty());
    assert!(store.logs().is_empty());
}
