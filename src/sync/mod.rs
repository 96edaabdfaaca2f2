//! Mirrors watched `.DBF` tables into a SQL database.
//!
//! - `models`: durable shapes (`FileState`, `SyncLogEntry`) tracked per file.
//! - `state_store`: the `StateStore` trait and its SQL/in-memory implementations.
//! - `engine`: the per-file CDC algorithm and domain-table classification.

pub mod engine;
pub mod models;
pub mod state_store;

pub use engine::{SyncEngine, SyncError, SyncOutcome, TargetTable, WATCHED_FILE_NAMES};
pub use models::{FileState, OperationType, ProcessingStatus, SyncLogEntry};
pub use state_store::{InMemoryStateStore, SqlStateStore, StateStore, StateStoreError};
