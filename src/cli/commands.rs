//! Implementations of the CLI subcommands.

use anyhow::{bail, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use crate::core::DbfReader;
use crate::sync::{SqlStateStore, SyncEngine, TargetTable, WATCHED_FILE_NAMES};
use crate::watcher::WatcherService;

/// Runs an initial scan of `watch_path` followed by continuous watching,
/// syncing changes to `database_url` as they arrive.
pub async fn serve(watch_path: PathBuf, database_url: &str) -> Result<()> {
    let store = SqlStateStore::connect(database_url).await?;
    let engine = Arc::new(SyncEngine::new(Arc::new(store)));
    let watcher = WatcherService::new(watch_path, engine);
    watcher.run().await
}

/// Lists watched `.DBF` files under `path` and their domain-table
/// classification, without opening a database connection.
pub async fn scan(path: PathBuf) -> Result<()> {
    let entries = std::fs::read_dir(&path)?;
    let mut found = 0usize;

    for entry in entries.flatten() {
        let file_path = entry.path();
        let Some(name) = file_path.file_name() else {
            continue;
        };
        let name = name.to_string_lossy().to_lowercase();
        if !WATCHED_FILE_NAMES.contains(&name.as_str()) {
            continue;
        }

        found += 1;
        let table = TargetTable::from_file_name(&name)
            .map(|t| t.as_str())
            .unwrap_or("unclassified");

        match DbfReader::open(&file_path) {
            Ok(reader) => {
                println!(
                    "{}: {} records, {} fields -> {}",
                    file_path.display(),
                    reader.header().num_records,
                    reader.fields().len(),
                    table
                );
            }
            Err(err) => {
                println!("{}: could not read ({err})", file_path.display());
            }
        }
    }

    println!("{found} watched file(s) found");
    Ok(())
}

/// Loads one file's records unconditionally, ignoring any prior checksum snapshot.
pub async fn bulk_load(file: PathBuf, database_url: &str) -> Result<()> {
    let store = SqlStateStore::connect(database_url).await?;
    let engine = SyncEngine::new(Arc::new(store));
    let total = engine.bulk_load_file(&file).await?;
    info!(file = %file.display(), total, "bulk load complete");
    println!("loaded {total} records from {}", file.display());
    Ok(())
}

/// Dumps a `.DBF`/`.DBT`/`.FPT` file's structure to stdout.
pub async fn debug_file(file: PathBuf, dump: String) -> Result<()> {
    let Some(ext) = file.extension() else {
        bail!("file has no extension: {file:?}");
    };
    let ext_lower = ext.to_string_lossy().to_lowercase();

    match ext_lower.as_str() {
        "dbf" => {
            let reader = DbfReader::open(&file)?;
            match dump.as_str() {
                "header" => {
                    println!("{:#?}", reader.header());
                    println!("requires_memo: {}", reader.requires_memo());
                    if let Some(kind) = reader.memo_kind() {
                        println!("memo_kind: {kind:?}");
                    }
                }
                "hex" => {
                    use std::io::Read;
                    let mut f = std::fs::File::open(&file)?;
                    let mut buffer = vec![0u8; 64];
                    let read = f.read(&mut buffer)?;
                    buffer.truncate(read);
                    println!("first {read} bytes:");
                    for (i, chunk) in buffer.chunks(16).enumerate() {
                        let hex_str: String =
                            chunk.iter().map(|b| format!("{b:02x}")).collect::<Vec<_>>().join(" ");
                        let ascii: String = chunk
                            .iter()
                            .map(|&b| if (32..127).contains(&b) { b as char } else { '.' })
                            .collect();
                        println!("{:04x}: {:48} |{}|", i * 16, hex_str, ascii);
                    }
                }
                "records" => {
                    println!("fields:");
                    for field in reader.fields() {
                        println!("  {} ({:?}, len {})", field.name, field.kind, field.length);
                    }
                    let mut count = 0;
                    for record in reader.read_all_records()? {
                        let record = record?;
                        println!("{count}: {record:?}");
                        count += 1;
                        if count >= 10 {
                            break;
                        }
                    }
                }
                other => bail!("unknown dump type: {other}. Options: header, hex, records"),
            }
        }
        "dbt" | "fpt" => {
            println!("memo sidecar: {}", file.display());
        }
        other => bail!("unsupported file extension: {other}"),
    }

    Ok(())
}
