//! Command-line interface.
//!
//! - `serve`: run the watcher and keep syncing changes indefinitely.
//! - `scan`: list watched files found under the watch path and their
//!   domain-table classification, without touching the database.
//! - `bulk-load <file>`: load one file's records unconditionally.
//! - `debug <file>`: dump a `.DBF`/`.DBT`/`.FPT` file's structure.

pub mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "dbfsync")]
#[command(about = "Mirrors legacy xBase/FoxPro .DBF tables into a SQL database")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Directory containing the watched .DBF files.
    #[arg(short, long, global = true)]
    pub watch_path: Option<PathBuf>,

    /// Configuration file (TOML).
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Scan once, then watch the directory and sync changes as they happen.
    Serve,
    /// List watched files and their domain-table classification.
    Scan {
        #[arg(default_value = "./data")]
        path: PathBuf,
    },
    /// Load one file's records unconditionally, ignoring any prior checksum snapshot.
    BulkLoad { file: PathBuf },
    /// Dump a DBF/memo file's structure.
    Debug {
        file: PathBuf,
        #[arg(short = 't', long, default_value = "header")]
        dump: String,
    },
}

impl Cli {
    pub async fn execute(self) -> Result<()> {
        let settings = if let Some(config_path) = &self.config {
            crate::config::Settings::from_path(config_path)?
        } else {
            crate::config::Settings::load().unwrap_or_default()
        };

        let watch_path = self
            .watch_path
            .as_ref()
            .unwrap_or(&settings.dbf_watch_path)
            .clone();

        match self.command {
            Commands::Serve => commands::serve(watch_path, &settings.database_url).await,
            Commands::Scan { path } => commands::scan(path).await,
            Commands::BulkLoad { file } => {
                commands::bulk_load(file, &settings.database_url).await
            }
            Commands::Debug { file, dump } => commands::debug_file(file, dump).await,
        }
    }
}
