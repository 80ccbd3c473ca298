//! Per-migration state machine.
//!
//! ```text
//! Pending -> Applying -> Applied
//!                     -> Failed      (transaction rolled back; ledger still Pending)
//!                     -> Partial     (non-transactional backend halted)
//! Applied -> RollingBack -> Pending
//!                        -> Inconsistent (fatal)
//! ```

use super::error::MigrationError;
use crate::storage::current_timestamp;
use serde::{Deserialize, Serialize};

/// State of a migration with respect to one target database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStatus {
    /// Not applied.
    Pending,
    /// Operations are being executed.
    Applying,
    /// Applied and recorded in the ledger.
    Applied,
    /// Application failed and was rolled back.
    Failed,
    /// Some operations ran on a non-transactional backend before a failure.
    Partial,
    /// The down operations are being executed.
    RollingBack,
    /// Rollback failed; the database needs manual intervention.
    Inconsistent,
}

impl MigrationStatus {
    /// Whether `self -> to` is a legal transition.
    pub fn can_transition_to(self, to: MigrationStatus) -> bool {
        use MigrationStatus::*;
        matches!(
            (self, to),
            (Pending, Applying)
                | (Applying, Applied)
                | (Applying, Failed)
                | (Applying, Partial)
                | (Failed, Pending)
                | (Applied, RollingBack)
                | (RollingBack, Pending)
                | (RollingBack, Inconsistent)
        )
    }

    /// Whether the status blocks further runs until an operator intervenes.
    pub fn requires_intervention(self) -> bool {
        matches!(self, MigrationStatus::Partial | MigrationStatus::Inconsistent)
    }

    /// Name as shown in reports; matches the serde encoding.
    pub fn as_str(self) -> &'static str {
        match self {
            MigrationStatus::Pending => "pending",
            MigrationStatus::Applying => "applying",
            MigrationStatus::Applied => "applied",
            MigrationStatus::Failed => "failed",
            MigrationStatus::Partial => "partial",
            MigrationStatus::RollingBack => "rolling_back",
            MigrationStatus::Inconsistent => "inconsistent",
        }
    }
}

impl std::fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress of one migration during a runner invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationState {
    /// Migration name.
    pub name: String,
    /// Current status.
    pub status: MigrationStatus,
    /// Number of operations executed so far.
    pub operations_completed: usize,
    /// Number of operations in the direction being run.
    pub total_operations: usize,
    /// When the current run started (microseconds since epoch).
    pub started_at: Option<u64>,
    /// When the current run finished (microseconds since epoch).
    pub completed_at: Option<u64>,
    /// Error message if the run failed.
    pub error: Option<String>,
}

impl MigrationState {
    /// Create a state for a migration with the given status.
    pub fn new(name: impl Into<String>, status: MigrationStatus, total_operations: usize) -> Self {
        Self {
            name: name.into(),
            status,
            operations_completed: 0,
            total_operations,
            started_at: None,
            completed_at: None,
            error: None,
        }
    }

    /// Move to `to`, rejecting illegal transitions.
    pub fn transition(&mut self, to: MigrationStatus) -> Result<(), MigrationError> {
        if !self.status.can_transition_to(to) {
            return Err(MigrationError::InvalidTransition {
                migration: self.name.clone(),
                from: self.status,
                to,
            });
        }
        match to {
            MigrationStatus::Applying | MigrationStatus::RollingBack => {
                self.started_at = Some(current_timestamp());
                self.completed_at = None;
                self.operations_completed = 0;
                self.error = None;
            }
            MigrationStatus::Applied | MigrationStatus::Pending => {
                self.completed_at = Some(current_timestamp());
            }
            _ => {}
        }
        tracing::debug!(migration = %self.name, from = %self.status, to = %to, "migration state transition");
        self.status = to;
        Ok(())
    }

    /// Start applying.
    pub fn begin_apply(&mut self) -> Result<(), MigrationError> {
        self.transition(MigrationStatus::Applying)
    }

    /// Start rolling back.
    pub fn begin_rollback(&mut self) -> Result<(), MigrationError> {
        self.transition(MigrationStatus::RollingBack)
    }

    /// Record one completed operation.
    pub fn operation_completed(&mut self) {
        self.operations_completed += 1;
    }

    /// Mark the run as failed with an error message.
    pub fn fail(&mut self, to: MigrationStatus, error: impl Into<String>) -> Result<(), MigrationError> {
        self.transition(to)?;
        self.completed_at = Some(current_timestamp());
        self.error = Some(error.into());
        Ok(())
    }
}
