//! Migration-specific error types.

use super::state::MigrationStatus;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Migration-specific errors.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// Structural drift detected between the chain, the snapshots and the
    /// database (hash discontinuity, edited migration, conflicting branches).
    #[error("schema conflict: {message}")]
    SchemaConflict {
        /// Description of the conflict.
        message: String,
    },

    /// An operation has no safe inverse and data loss was not acknowledged.
    #[error("irreversible change: {operation}: {reason} (pass allow_data_loss to proceed)")]
    IrreversibleChange {
        /// The operation that cannot be reversed.
        operation: String,
        /// Why it cannot be reversed.
        reason: String,
    },

    /// The ledger records a migration the chain does not contain, or records
    /// migrations out of chain order.
    #[error("ledger diverged at {migration}: {message}")]
    LedgerDiverged {
        /// The offending ledger entry.
        migration: String,
        /// Description of the divergence.
        message: String,
    },

    /// The migration lock could not be acquired in time.
    #[error("timed out after {waited:?} waiting for migration lock (held by {holder})")]
    LockTimeout {
        /// Owner recorded on the lock row, if it could be read.
        holder: String,
        /// How long acquisition was attempted.
        waited: Duration,
    },

    /// A non-transactional backend halted part way through a migration.
    #[error(
        "migration {migration} partially applied: {} of {total} operations completed: {message}",
        .completed.len()
    )]
    PartialApply {
        /// The migration that was interrupted.
        migration: String,
        /// Descriptions of the operations that completed.
        completed: Vec<String>,
        /// Total number of operations in the migration.
        total: usize,
        /// What stopped the migration.
        message: String,
    },

    /// A rollback failed; the database needs manual intervention.
    #[error("inconsistent state in {migration}: {message}")]
    InconsistentState {
        /// The migration whose rollback failed.
        migration: String,
        /// Description of the failure.
        message: String,
    },

    /// A migration failed and its transaction was rolled back.
    #[error("migration {migration} failed at operation {operation_index}: {message}")]
    MigrationFailed {
        /// The migration that failed.
        migration: String,
        /// Index of the failing operation.
        operation_index: usize,
        /// Error message.
        message: String,
    },

    /// The model is internally inconsistent.
    #[error("invalid model: {message}")]
    InvalidModel {
        /// Description of the problem.
        message: String,
    },

    /// An operation's preconditions do not hold for the model it is applied to.
    #[error("cannot apply {operation}: {message}")]
    InvalidOperation {
        /// The operation being applied.
        operation: String,
        /// Description of the failed precondition.
        message: String,
    },

    /// The requested change cannot be expressed as operations.
    #[error("unsupported change: {message}")]
    UnsupportedChange {
        /// Description of the change.
        message: String,
    },

    /// A migration name does not follow `<sequence>_<description>`.
    #[error("invalid migration name '{name}': {reason}")]
    InvalidMigrationName {
        /// The rejected name.
        name: String,
        /// Why it was rejected.
        reason: String,
    },

    /// No changes detected between the models.
    #[error("no changes detected between {from_hash} and {to_hash}")]
    NoChanges {
        /// Source model hash.
        from_hash: String,
        /// Target model hash.
        to_hash: String,
    },

    /// Migration not found in the chain.
    #[error("migration not found: {name}")]
    MigrationNotFound {
        /// The name or sequence that was looked up.
        name: String,
    },

    /// An illegal migration state transition was attempted.
    #[error("invalid transition for {migration}: {from} -> {to}")]
    InvalidTransition {
        /// The migration being transitioned.
        migration: String,
        /// Current status.
        from: MigrationStatus,
        /// Requested status.
        to: MigrationStatus,
    },

    /// A snapshot file does not match its recorded hash.
    #[error("snapshot {path:?} corrupted: expected hash {expected}, found {actual}")]
    SnapshotCorrupted {
        /// Path of the snapshot file.
        path: PathBuf,
        /// Hash recorded in the file.
        expected: String,
        /// Hash computed from the content.
        actual: String,
    },

    /// Backend error.
    #[error("backend error: {0}")]
    Backend(#[from] crate::error::Error),

    /// Filesystem error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Deserialization error.
    #[error("deserialization error: {0}")]
    Deserialization(String),
}

impl MigrationError {
    /// Whether the error leaves the target database needing operator action.
    pub fn requires_intervention(&self) -> bool {
        matches!(
            self,
            MigrationError::PartialApply { .. } | MigrationError::InconsistentState { .. }
        )
    }
}
