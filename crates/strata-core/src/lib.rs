//! Strata Core - Schema catalog, differ, migration generator and runner.
//!
//! This crate provides the migration engine behind the `strata` CLI.

pub mod backend;
pub mod catalog;
pub mod dialect;
pub mod error;
pub mod migration;
pub mod storage;
pub mod workspace;

pub use backend::{Connection, Row, SqliteConnection};
pub use catalog::{Column, ColumnType, Constraint, ConstraintKind, Index, Model, ReferentialAction, Table};
pub use dialect::{dialect_by_name, Dialect, PostgresDialect, SqliteDialect};
pub use error::Error;
pub use migration::{
    diff, generate, Delta, GenerateOptions, Ledger, LedgerEntry, LedgerState, Migration,
    MigrationChain, MigrationError, MigrationLock, MigrationState, MigrationStatus, Operation,
    RenameHints, Resolution, RollbackScope, RunReport, Runner, RunnerConfig, StatusReport,
};
pub use storage::{MigrationRepository, Snapshot, SnapshotStore};
pub use workspace::Workspace;
