//! CDC pipeline that mirrors legacy xBase/FoxPro `.DBF` tables into a SQL
//! database, organized into:
//!
//! - `core`: low-level `.DBF`/memo parsing, checksums, and delta detection.
//! - `sync`: domain-table classification and the per-file sync algorithm.
//! - `watcher`: filesystem watching and debounced sync dispatch.
//! - `config`: configuration loading (file + environment overrides).
//! - `cli`: the operational command-line interface.

pub mod cli;
pub mod config;
pub mod core;
pub mod sync;
pub mod watcher;

pub use config::Settings;
