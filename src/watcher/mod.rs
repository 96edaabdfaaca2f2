//! Filesystem watcher that turns `.DBF` write activity into sync runs.
//!
//! Mirrors the original service's shape: a `notify` watch on the data
//! directory, a short fixed debounce so a burst of writes to one file
//! collapses into a single sync, and an in-flight set so two events for the
//! same file never run concurrently — distinct files still sync in
//! parallel.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{RecursiveMode, Watcher};
use tokio::sync::{mpsc, Mutex};
use tracing::{error, info, warn};

use crate::sync::{SyncEngine, WATCHED_FILE_NAMES};

const DEBOUNCE: Duration = Duration::from_secs(1);

pub struct WatcherService {
    watch_path: PathBuf,
    engine: Arc<SyncEngine>,
    in_flight: Arc<Mutex<HashSet<PathBuf>>>,
}

impl WatcherService {
    pub fn new(watch_path: PathBuf, engine: Arc<SyncEngine>) -> Self {
        Self {
            watch_path,
            engine,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Arms the filesystem watcher, runs the initial scan of every watched
    /// file currently present, then blocks watching for further changes
    /// until the process is signaled to stop.
    ///
    /// The watcher is armed *before* the initial scan runs: any write that
    /// lands on a watched file while the scan is still walking the tree
    /// queues in the event channel instead of being missed, since
    /// `initial_scan` itself doesn't consult that channel.
    pub async fn run(&self) -> anyhow::Result<()> {
        let (tx, mut rx) = mpsc::channel::<PathBuf>(256);
        let watch_path = self.watch_path.clone();

        let mut watcher = notify::recommended_watcher(move |event: notify::Result<notify::Event>| {
            let event = match event {
                Ok(event) => event,
                Err(err) => {
                    error!(error = %err, "filesystem watch error");
                    return;
                }
            };
            if !matches!(
                event.kind,
                notify::EventKind::Modify(_) | notify::EventKind::Create(_)
            ) {
                return;
            }
            for path in event.paths {
                if is_watched_file(&path) {
                    let _ = tx.blocking_send(path);
                }
            }
        })?;
        watcher.watch(&watch_path, RecursiveMode::Recursive)?;

        info!(path = %watch_path.display(), "watching for DBF changes");

        self.initial_scan().await;

        while let Some(path) = rx.recv().await {
            self.spawn_debounced_sync(path);
        }
        Ok(())
    }

    async fn initial_scan(&self) {
        let mut files = collect_watched_files(&self.watch_path);
        files.sort();

        for path in files {
            if let Err(err) = self.engine.process_dbf_file(&path).await {
                error!(error = %err, file = %path.display(), "initial sync failed");
            }
        }
    }

    fn spawn_debounced_sync(&self, path: PathBuf) {
        let in_flight = self.in_flight.clone();
        let engine = self.engine.clone();
        tokio::spawn(async move {
            {
                let mut guard = in_flight.lock().await;
                if guard.contains(&path) {
                    return;
                }
                guard.insert(path.clone());
            }

            tokio::time::sleep(DEBOUNCE).await;

            match engine.process_dbf_file(&path).await {
                Ok(outcome) if outcome.changed => {
                    info!(
                        file = %path.display(),
                        inserted = outcome.inserted,
                        updated = outcome.updated,
                        deleted = outcome.deleted,
                        "applied changes"
                    );
                }
                Ok(_) => {}
                Err(err) => error!(error = %err, file = %path.display(), "sync failed"),
            }

            in_flight.lock().await.remove(&path);
        });
    }
}

/// Recursively walks `root`, returning every watched `.dbf` file found at
/// any depth. Matches the `RecursiveMode::Recursive` scope the live watcher
/// runs under, so a file nested in a subdirectory is picked up by the
/// initial scan the same way a later write to it would be.
fn collect_watched_files(root: &Path) -> Vec<PathBuf> {
    let mut found = Vec::new();
    visit_dir(root, &mut found);
    found
}

fn visit_dir(dir: &Path, found: &mut Vec<PathBuf>) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            warn!(error = %err, path = %dir.display(), "could not read watch directory");
            return;
        }
    };

    for entry in entries.filter_map(|entry| entry.ok()) {
        let path = entry.path();
        let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
        if is_dir {
            visit_dir(&path, found);
        } else if is_watched_file(&path) {
            found.push(path);
        }
    }
}

fn is_watched_file(path: &Path) -> bool {
    let Some(ext) = path.extension() else {
        return false;
    };
    if !ext.eq_ignore_ascii_case("dbf") {
        return false;
    }
    let Some(name) = path.file_name() else {
        return false;
    };
    let name = name.to_string_lossy().to_lowercase();
    WATCHED_FILE_NAMES.contains(&name.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watched_file_names_are_matched_case_insensitively() {
        assert!(is_watched_file(Path::new("/data/CLIENTES.DBF")));
        assert!(is_watched_file(Path::new("/data/arts.dbf")));
        assert!(!is_watched_file(Path::new("/data/other.dbf")));
        assert!(!is_watched_file(Path::new("/data/movim.txt")));
    }

    #[test]
    fn collect_watched_files_recurses_into_subdirectories() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("clientes.dbf"), b"top-level").unwrap();

        let nested = dir.path().join("branch_2024");
        std::fs::create_dir(&nested).unwrap();
        std::fs::write(nested.join("arts.dbf"), b"nested").unwrap();
        std::fs::write(nested.join("ignored.txt"), b"not watched").unwrap();

        let mut found = collect_watched_files(dir.path());
        found.sort();

        let mut expected = vec![dir.path().join("clientes.dbf"), nested.join("arts.dbf")];
        expected.sort();
        assert_eq!(found, expected);
    }
}
