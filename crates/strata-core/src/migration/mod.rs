//! Migration engine for Strata.
//!
//! This module provides:
//! - Structural diffing of two [`Model`]s into an ordered [`Delta`]
//! - Generation of reversible [`Migration`]s from a delta
//! - The [`MigrationChain`] linking migrations in order
//! - The in-database [`Ledger`] and advisory [`MigrationLock`]
//! - A [`Runner`] that applies and rolls back migrations
//!
//! # Example
//!
//! ```ignore
//! use strata_core::migration::{diff, generate, GenerateOptions, MigrationChain, Runner, RunnerConfig};
//!
//! let delta = diff(&current, &desired)?;
//! let migration = generate(&delta, "0001_create_authors", &GenerateOptions::default())?;
//!
//! let mut chain = MigrationChain::new();
//! chain.push(migration)?;
//!
//! let runner = Runner::new(RunnerConfig::default());
//! let report = runner.apply(&chain, &mut conn)?;
//! ```

pub mod chain;
pub mod diff;
pub mod error;
pub mod generator;
pub mod ledger;
pub mod lock;
pub mod operation;
pub mod runner;
pub mod state;

use crate::catalog::Model;

// Diff types
pub use diff::{ColumnRename, Delta, RenameHints, TableRename};

// Error types
pub use error::MigrationError;

// Operation types
pub use operation::{apply_all, Operation};

// Generator types
pub use generator::{generate, GenerateOptions, Migration, MigrationName};

// Chain types
pub use chain::MigrationChain;

// Ledger types
pub use ledger::{Ledger, LedgerEntry, LedgerState, Resolution, DEFAULT_LEDGER_TABLE};

// Lock types
pub use lock::{MigrationLock, DEFAULT_LOCK_TABLE};

// Runner types
pub use runner::{
    Direction, RollbackScope, RunReport, Runner, RunnerConfig, ScriptStep, StatusReport,
    StatusRow,
};

// State types
pub use state::{MigrationState, MigrationStatus};

/// Compute the delta between two models without rename hints.
pub fn diff(old: &Model, new: &Model) -> Result<Delta, MigrationError> {
    Delta::compute(old, new)
}
