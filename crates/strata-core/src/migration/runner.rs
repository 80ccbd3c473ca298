//! Migration runner.
//!
//! Applies and rolls back migrations of a [`MigrationChain`] against a live
//! [`Connection`].
//!
//! On a backend with transactional DDL every migration runs in its own
//! transaction together with its ledger write, so a failure leaves both the
//! schema and the ledger exactly as they were. Without transactional DDL the
//! runner executes one operation at a time, records progress after each and
//! stops at the first failure with [`MigrationError::PartialApply`].

use super::chain::MigrationChain;
use super::error::MigrationError;
use super::generator::Migration;
use super::ledger::{pending_from, verify_entries, Ledger, Resolution, DEFAULT_LEDGER_TABLE};
use super::lock::{MigrationLock, DEFAULT_LOCK_TABLE};
use super::operation::Operation;
use super::state::{MigrationState, MigrationStatus};
use crate::backend::Connection;
use crate::catalog::Model;
use crate::dialect::Dialect;
use crate::error::Error;
use crate::storage::current_timestamp;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Runner configuration.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// How long to wait for the migration lock.
    pub lock_timeout: Duration,
    /// Delay between lock attempts.
    pub poll_interval: Duration,
    /// Render statements without executing them.
    pub dry_run: bool,
    /// Ledger table name.
    pub ledger_table: String,
    /// Lock table name.
    pub lock_table: String,
    /// Owner recorded on the lock row.
    pub owner: String,
    /// Apply up to and including this migration instead of the whole chain.
    pub target: Option<String>,
    /// Checked between migrations; set to stop early.
    pub cancel: Option<Arc<AtomicBool>>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(100),
            dry_run: false,
            ledger_table: DEFAULT_LEDGER_TABLE.to_string(),
            lock_table: DEFAULT_LOCK_TABLE.to_string(),
            owner: format!("strata-{}-{}", std::process::id(), current_timestamp()),
            target: None,
            cancel: None,
        }
    }
}

impl RunnerConfig {
    /// Create default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the lock timeout.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Set the lock poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Enable or disable dry-run mode.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Set the ledger table name.
    pub fn with_ledger_table(mut self, table: impl Into<String>) -> Self {
        self.ledger_table = table.into();
        self
    }

    /// Set the lock table name.
    pub fn with_lock_table(mut self, table: impl Into<String>) -> Self {
        self.lock_table = table.into();
        self
    }

    /// Set the lock owner.
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    /// Stop applying after `migration`.
    pub fn with_target(mut self, migration: Option<String>) -> Self {
        self.target = migration;
        self
    }

    /// Set the cancellation flag.
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }
}

/// Direction a migration is run in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Forward (`up`).
    Up,
    /// Reverse (`down`).
    Down,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Up => write!(f, "up"),
            Direction::Down => write!(f, "down"),
        }
    }
}

/// Which applied migrations a rollback undoes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RollbackScope {
    /// The most recent `n`.
    Last(usize),
    /// Everything applied after the named migration.
    To(String),
    /// Every applied migration.
    All,
}

/// Statements for one migration in one direction.
#[derive(Debug, Clone, Serialize)]
pub struct ScriptStep {
    /// Migration name.
    pub migration: String,
    /// Direction.
    pub direction: Direction,
    /// Statements, including the ledger write.
    pub statements: Vec<String>,
}

/// Outcome of an apply or rollback run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// Direction of the run.
    pub direction: Direction,
    /// Whether statements were only rendered.
    pub dry_run: bool,
    /// Migrations run (or, in dry-run mode, that would run), in order.
    pub migrations: Vec<String>,
    /// Final state of each migration run.
    pub states: Vec<MigrationState>,
    /// Rendered statements (dry-run only).
    pub steps: Vec<ScriptStep>,
    /// Whether the run stopped early on the cancellation flag.
    pub cancelled: bool,
}

impl RunReport {
    fn new(direction: Direction, dry_run: bool) -> Self {
        Self {
            direction,
            dry_run,
            migrations: Vec::new(),
            states: Vec::new(),
            steps: Vec::new(),
            cancelled: false,
        }
    }

    /// Check if nothing ran.
    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }

    /// Rendered statements as one script.
    pub fn script(&self) -> String {
        let mut out = String::new();
        for step in &self.steps {
            out.push_str(&format!("-- {} ({})\n", step.migration, step.direction));
            for statement in &step.statements {
                out.push_str(statement);
                out.push_str(";\n");
            }
            out.push('\n');
        }
        out
    }
}

/// Status of one chain migration against a database.
#[derive(Debug, Clone, Serialize)]
pub struct StatusRow {
    /// Migration sequence.
    pub sequence: u32,
    /// Migration name.
    pub name: String,
    /// Applied, pending, partial or inconsistent.
    pub status: MigrationStatus,
    /// Number of `up` operations.
    pub operations: usize,
    /// Number of `up` operations recorded as applied.
    pub operations_applied: usize,
    /// When the ledger entry was written (microseconds since epoch).
    pub applied_at: Option<u64>,
    /// Operations whose data loss was acknowledged.
    pub data_loss: Vec<String>,
}

/// Status of a whole chain against a database.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    /// One row per chain migration, in order.
    pub rows: Vec<StatusRow>,
    /// Current migration lock holder.
    pub lock_holder: Option<String>,
}

impl StatusReport {
    /// Migrations not yet applied.
    pub fn pending(&self) -> impl Iterator<Item = &StatusRow> {
        self.rows.iter().filter(|r| r.status == MigrationStatus::Pending)
    }

    /// Entries blocking further runs.
    pub fn blocked(&self) -> impl Iterator<Item = &StatusRow> {
        self.rows.iter().filter(|r| r.status.requires_intervention())
    }
}

/// A failed statement during execution.
struct StepFailure {
    operation_index: usize,
    statements_executed: usize,
    message: String,
}

/// Applies and rolls back migrations.
#[derive(Debug, Clone)]
pub struct Runner {
    config: RunnerConfig,
    ledger: Ledger,
    lock: MigrationLock,
}

impl Runner {
    /// Create a runner.
    pub fn new(config: RunnerConfig) -> Self {
        let ledger = Ledger::new(config.ledger_table.clone());
        let lock = MigrationLock::new(config.lock_table.clone(), config.owner.clone())
            .with_timeout(config.lock_timeout)
            .with_poll_interval(config.poll_interval);
        Self {
            config,
            ledger,
            lock,
        }
    }

    /// Runner configuration.
    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// The ledger this runner writes.
    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// The lock this runner takes.
    pub fn lock(&self) -> &MigrationLock {
        &self.lock
    }

    /// Report which chain migrations are applied.
    pub fn status(
        &self,
        chain: &MigrationChain,
        conn: &mut dyn Connection,
    ) -> Result<StatusReport, MigrationError> {
        let entries = self.ledger.entries(conn)?;
        verify_entries(&entries, chain)?;

        let rows = chain
            .iter()
            .map(|m| {
                let entry = entries.get(m.sequence as usize - 1);
                StatusRow {
                    sequence: m.sequence,
                    name: m.name.clone(),
                    status: entry.map_or(MigrationStatus::Pending, |e| e.state.status()),
                    operations: m.up.len(),
                    operations_applied: entry.map_or(0, |e| e.operations_applied),
                    applied_at: entry.map(|e| e.applied_at),
                    data_loss: m.data_loss.clone(),
                }
            })
            .collect();

        Ok(StatusReport {
            rows,
            lock_holder: self.lock.holder(conn)?,
        })
    }

    /// Apply pending migrations, up to the configured target.
    pub fn apply(
        &self,
        chain: &MigrationChain,
        conn: &mut dyn Connection,
    ) -> Result<RunReport, MigrationError> {
        let models = chain.replay()?;
        let dialect = conn.dialect();

        if self.config.dry_run {
            let entries = self.ledger.entries(conn)?;
            let pending = pending_from(&entries, chain)?;
            let targets = self.select_apply_targets(chain, pending)?;
            let mut report = RunReport::new(Direction::Up, true);
            for migration in targets {
                let before = &models[migration.sequence as usize - 1];
                report.steps.push(self.render_step(dialect, migration, Direction::Up, before)?);
                report.migrations.push(migration.name.clone());
            }
            return Ok(report);
        }

        self.lock.with_lock(conn, |conn| {
            self.ledger.ensure_table(conn)?;
            let pending = self.ledger.pending(conn, chain)?;
            let targets = self.select_apply_targets(chain, pending)?;

            // Render everything before touching the schema.
            let mut plan = Vec::with_capacity(targets.len());
            for migration in targets {
                let before = &models[migration.sequence as usize - 1];
                let rendered = render_operations(dialect, &migration.up, before, &migration.to_hash)?;
                plan.push((migration, rendered));
            }

            let mut report = RunReport::new(Direction::Up, false);
            for (migration, rendered) in plan {
                if self.cancelled() {
                    info!(next = %migration.name, "apply cancelled");
                    report.cancelled = true;
                    break;
                }
                let state = with_foreign_keys_suspended(conn, &migration.name, |conn, enforced| {
                    self.apply_one(conn, migration, &rendered, enforced)
                })?;
                report.migrations.push(migration.name.clone());
                report.states.push(state);
            }
            info!(applied = report.migrations.len(), "apply finished");
            Ok(report)
        })
    }

    /// Roll back applied migrations, most recent first.
    pub fn rollback(
        &self,
        chain: &MigrationChain,
        conn: &mut dyn Connection,
        scope: RollbackScope,
    ) -> Result<RunReport, MigrationError> {
        let models = chain.replay()?;
        let dialect = conn.dialect();

        if self.config.dry_run {
            let entries = self.ledger.entries(conn)?;
            let applied = pending_from(&entries, chain).map(|_| entries.len())?;
            let targets = select_rollback_targets(chain, applied, &scope)?;
            let mut report = RunReport::new(Direction::Down, true);
            for migration in targets {
                let after = &models[migration.sequence as usize];
                report.steps.push(self.render_step(dialect, migration, Direction::Down, after)?);
                report.migrations.push(migration.name.clone());
            }
            return Ok(report);
        }

        self.lock.with_lock(conn, |conn| {
            self.ledger.ensure_table(conn)?;
            let entries = self.ledger.entries(conn)?;
            pending_from(&entries, chain)?;
            let targets = select_rollback_targets(chain, entries.len(), &scope)?;

            let mut plan = Vec::with_capacity(targets.len());
            for migration in targets {
                let after = &models[migration.sequence as usize];
                let rendered = render_operations(dialect, &migration.down, after, &migration.from_hash)?;
                plan.push((migration, rendered));
            }

            let mut report = RunReport::new(Direction::Down, false);
            for (migration, rendered) in plan {
                if self.cancelled() {
                    info!(next = %migration.name, "rollback cancelled");
                    report.cancelled = true;
                    break;
                }
                let state = with_foreign_keys_suspended(conn, &migration.name, |conn, enforced| {
                    self.rollback_one(conn, migration, &rendered, enforced)
                })?;
                report.migrations.push(migration.name.clone());
                report.states.push(state);
            }
            info!(rolled_back = report.migrations.len(), "rollback finished");
            Ok(report)
        })
    }

    /// Render the SQL that moves a database from one chain position to
    /// another, without executing anything.
    ///
    /// `from` and `to` name migrations; `None` means the empty model for
    /// `from` and the chain head for `to`. A `to` before `from` renders the
    /// reverse direction.
    pub fn script(
        &self,
        chain: &MigrationChain,
        from: Option<&str>,
        to: Option<&str>,
        dialect: &dyn Dialect,
    ) -> Result<String, MigrationError> {
        let models = chain.replay()?;
        let position = |name: Option<&str>, default: usize| -> Result<usize, MigrationError> {
            match name {
                Some(name) => Ok(chain.require(name)?.sequence as usize),
                None => Ok(default),
            }
        };
        let from = position(from, 0)?;
        let to = position(to, chain.len())?;
        let migrations = chain.migrations();

        let steps: Vec<ScriptStep> = if to >= from {
            migrations[from..to]
                .iter()
                .map(|m| self.render_step(dialect, m, Direction::Up, &models[m.sequence as usize - 1]))
                .collect::<Result<_, _>>()?
        } else {
            migrations[to..from]
                .iter()
                .rev()
                .map(|m| self.render_step(dialect, m, Direction::Down, &models[m.sequence as usize]))
                .collect::<Result<_, _>>()?
        };

        let mut out = format!(
            "-- strata migration script ({})\n-- from {} to {}\n\n{};\n\n",
            dialect.name(),
            label(chain, from),
            label(chain, to),
            self.ledger.create_statement()
        );
        for step in steps {
            out.push_str(&format!("-- {} ({})\n", step.migration, step.direction));
            for statement in dialect.script_prelude() {
                out.push_str(&format!("{};\n", statement));
            }
            out.push_str("BEGIN;\n");
            for statement in &step.statements {
                out.push_str(statement);
                out.push_str(";\n");
            }
            out.push_str("COMMIT;\n");
            for statement in dialect.script_postlude() {
                out.push_str(&format!("{};\n", statement));
            }
            out.push('\n');
        }
        Ok(out)
    }

    /// Settle a partial or inconsistent ledger entry.
    pub fn resolve(
        &self,
        chain: &MigrationChain,
        conn: &mut dyn Connection,
        name: &str,
        resolution: Resolution,
    ) -> Result<(), MigrationError> {
        self.lock
            .with_lock(conn, |conn| self.ledger.resolve(conn, chain, name, resolution))
    }

    /// Force-release the migration lock. Returns the previous holder.
    pub fn unlock(&self, conn: &mut dyn Connection) -> Result<Option<String>, MigrationError> {
        self.lock.force_release(conn)
    }

    fn cancelled(&self) -> bool {
        self.config
            .cancel
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
    }

    fn select_apply_targets<'c>(
        &self,
        chain: &'c MigrationChain,
        pending: Vec<&'c Migration>,
    ) -> Result<Vec<&'c Migration>, MigrationError> {
        let Some(target) = &self.config.target else {
            return Ok(pending);
        };
        let target = chain.require(target)?;
        Ok(pending
            .into_iter()
            .take_while(|m| m.sequence <= target.sequence)
            .collect())
    }

    fn render_step(
        &self,
        dialect: &dyn Dialect,
        migration: &Migration,
        direction: Direction,
        before: &Model,
    ) -> Result<ScriptStep, MigrationError> {
        let (operations, expected) = match direction {
            Direction::Up => (&migration.up, &migration.to_hash),
            Direction::Down => (&migration.down, &migration.from_hash),
        };
        let mut statements: Vec<String> = render_operations(dialect, operations, before, expected)?
            .into_iter()
            .flatten()
            .collect();
        statements.push(match direction {
            Direction::Up => self.ledger.upsert_statement(
                migration,
                super::ledger::LedgerState::Applied,
                migration.up.len(),
                current_timestamp(),
            ),
            Direction::Down => self.ledger.delete_statement(migration),
        });
        Ok(ScriptStep {
            migration: migration.name.clone(),
            direction,
            statements,
        })
    }

    fn apply_one(
        &self,
        conn: &mut dyn Connection,
        migration: &Migration,
        rendered: &[Vec<String>],
        check_references: bool,
    ) -> Result<MigrationState, MigrationError> {
        let mut state = MigrationState::new(&migration.name, MigrationStatus::Pending, migration.up.len());
        state.begin_apply()?;
        info!(migration = %migration.name, operations = migration.up.len(), "applying migration");

        if conn.supports_transactional_ddl() {
            let outcome = run_transaction(conn, &migration.name, rendered, &mut state, |conn| {
                check_foreign_keys(conn, check_references)?;
                self.ledger.record(conn, migration)
            });
            if let Err(failure) = outcome {
                state.fail(MigrationStatus::Failed, &failure.message)?;
                warn!(
                    migration = %migration.name,
                    operation = failure.operation_index,
                    error = %failure.message,
                    "migration failed, transaction rolled back"
                );
                return Err(MigrationError::MigrationFailed {
                    migration: migration.name.clone(),
                    operation_index: failure.operation_index,
                    message: failure.message,
                });
            }
        } else {
            let total = migration.up.len();
            let outcome = execute_rendered(conn, &migration.name, rendered, &mut state, |conn, done| {
                if done < total {
                    self.ledger.record_progress(conn, migration, done)?;
                }
                Ok(())
            })
            .and_then(|_| {
                check_foreign_keys(conn, check_references).map_err(|e| StepFailure {
                    operation_index: total,
                    statements_executed: rendered.iter().map(Vec::len).sum(),
                    message: e.to_string(),
                })
            });
            if let Err(failure) = outcome {
                if failure.statements_executed == 0 {
                    state.fail(MigrationStatus::Failed, &failure.message)?;
                    return Err(MigrationError::MigrationFailed {
                        migration: migration.name.clone(),
                        operation_index: failure.operation_index,
                        message: failure.message,
                    });
                }
                self.ledger
                    .record_progress(conn, migration, failure.operation_index)?;
                state.fail(MigrationStatus::Partial, &failure.message)?;
                let completed: Vec<String> = migration.up[..failure.operation_index]
                    .iter()
                    .map(Operation::to_string)
                    .collect();
                error!(
                    migration = %migration.name,
                    completed = completed.len(),
                    total,
                    error = %failure.message,
                    "migration partially applied"
                );
                return Err(MigrationError::PartialApply {
                    migration: migration.name.clone(),
                    completed,
                    total,
                    message: failure.message,
                });
            }
            self.ledger.record(conn, migration)?;
        }

        state.transition(MigrationStatus::Applied)?;
        info!(migration = %migration.name, "migration applied");
        Ok(state)
    }

    fn rollback_one(
        &self,
        conn: &mut dyn Connection,
        migration: &Migration,
        rendered: &[Vec<String>],
        check_references: bool,
    ) -> Result<MigrationState, MigrationError> {
        let mut state = MigrationState::new(&migration.name, MigrationStatus::Applied, migration.down.len());
        state.begin_rollback()?;
        if !migration.is_lossless() {
            warn!(migration = %migration.name, lost = ?migration.data_loss, "rolling back a migration that destroyed data");
        }
        info!(migration = %migration.name, operations = migration.down.len(), "rolling back migration");

        let outcome = if conn.supports_transactional_ddl() {
            run_transaction(conn, &migration.name, rendered, &mut state, |conn| {
                check_foreign_keys(conn, check_references)?;
                self.ledger.unrecord(conn, migration)
            })
        } else {
            execute_rendered(conn, &migration.name, rendered, &mut state, |_, _| Ok(())).and_then(|_| {
                check_foreign_keys(conn, check_references)
                    .and_then(|_| self.ledger.unrecord(conn, migration))
                    .map_err(|e| StepFailure {
                        operation_index: rendered.len(),
                        statements_executed: 0,
                        message: e.to_string(),
                    })
            })
        };

        if let Err(failure) = outcome {
            if let Err(e) = self.ledger.mark_inconsistent(conn, migration) {
                error!(migration = %migration.name, error = %e, "could not flag ledger entry as inconsistent");
            }
            state.fail(MigrationStatus::Inconsistent, &failure.message)?;
            error!(
                migration = %migration.name,
                operation = failure.operation_index,
                error = %failure.message,
                "rollback failed, manual intervention required"
            );
            return Err(MigrationError::InconsistentState {
                migration: migration.name.clone(),
                message: format!(
                    "rollback failed at operation {}: {}",
                    failure.operation_index, failure.message
                ),
            });
        }

        state.transition(MigrationStatus::Pending)?;
        info!(migration = %migration.name, "migration rolled back");
        Ok(state)
    }
}

/// Render each operation against the model it applies to, checking that
/// the result hashes to `expected`.
fn render_operations(
    dialect: &dyn Dialect,
    operations: &[Operation],
    before: &Model,
    expected: &str,
) -> Result<Vec<Vec<String>>, MigrationError> {
    let mut model = before.clone();
    let mut rendered = Vec::with_capacity(operations.len());
    for operation in operations {
        rendered.push(dialect.render(operation, &model)?);
        operation.apply(&mut model)?;
    }
    let actual = model.content_hash();
    if actual != expected {
        return Err(MigrationError::SchemaConflict {
            message: format!("operations produce model {} but {} was recorded", actual, expected),
        });
    }
    Ok(rendered)
}

/// Run `f` with foreign-key enforcement off, restoring it afterwards. `f`
/// is told whether enforcement was on, and so whether references need
/// checking before the migration is recorded.
fn with_foreign_keys_suspended<T>(
    conn: &mut dyn Connection,
    migration: &str,
    f: impl FnOnce(&mut dyn Connection, bool) -> Result<T, MigrationError>,
) -> Result<T, MigrationError> {
    let enforced = conn.suspend_foreign_keys()?;
    let result = f(&mut *conn, enforced);
    if enforced {
        if let Err(e) = conn.resume_foreign_keys() {
            warn!(migration, error = %e, "failed to restore foreign key enforcement");
        }
    }
    result
}

fn check_foreign_keys(conn: &mut dyn Connection, enabled: bool) -> Result<(), MigrationError> {
    if !enabled {
        return Ok(());
    }
    let violations = conn.foreign_key_violations()?;
    if violations.is_empty() {
        return Ok(());
    }
    Err(Error::ConstraintViolation(format!(
        "foreign key check failed for {}",
        violations.join(", ")
    ))
    .into())
}

fn execute_rendered(
    conn: &mut dyn Connection,
    migration: &str,
    rendered: &[Vec<String>],
    state: &mut MigrationState,
    mut after_operation: impl FnMut(&mut dyn Connection, usize) -> Result<(), MigrationError>,
) -> Result<(), StepFailure> {
    let mut executed = 0;
    for (index, statements) in rendered.iter().enumerate() {
        for statement in statements {
            debug!(migration, operation = index, %statement, "executing statement");
            conn.execute(statement).map_err(|e| StepFailure {
                operation_index: index,
                statements_executed: executed,
                message: e.to_string(),
            })?;
            executed += 1;
        }
        state.operation_completed();
        after_operation(&mut *conn, index + 1).map_err(|e| StepFailure {
            operation_index: index + 1,
            statements_executed: executed,
            message: e.to_string(),
        })?;
    }
    Ok(())
}

/// Execute `rendered` and `finish` in one transaction, rolling back on any
/// failure.
fn run_transaction(
    conn: &mut dyn Connection,
    migration: &str,
    rendered: &[Vec<String>],
    state: &mut MigrationState,
    finish: impl FnOnce(&mut dyn Connection) -> Result<(), MigrationError>,
) -> Result<(), StepFailure> {
    conn.begin().map_err(|e| StepFailure {
        operation_index: 0,
        statements_executed: 0,
        message: e.to_string(),
    })?;

    let outcome = execute_rendered(&mut *conn, migration, rendered, state, |_, _| Ok(()))
        .and_then(|_| {
            finish(&mut *conn)
                .and_then(|_| conn.commit().map_err(MigrationError::from))
                .map_err(|e| StepFailure {
                    operation_index: rendered.len(),
                    statements_executed: 0,
                    message: e.to_string(),
                })
        });

    if outcome.is_err() {
        if let Err(e) = conn.rollback() {
            warn!(migration, error = %e, "transaction rollback failed");
        }
    }
    outcome
}

fn select_rollback_targets<'c>(
    chain: &'c MigrationChain,
    applied: usize,
    scope: &RollbackScope,
) -> Result<Vec<&'c Migration>, MigrationError> {
    let applied = chain.migrations()[..applied].iter().rev();
    let targets = match scope {
        RollbackScope::Last(n) => applied.take(*n).collect(),
        RollbackScope::All => applied.collect(),
        RollbackScope::To(name) => {
            let target = chain.require(name)?;
            applied.take_while(|m| m.sequence > target.sequence).collect()
        }
    };
    Ok(targets)
}

fn label(chain: &MigrationChain, position: usize) -> String {
    match position {
        0 => "empty".to_string(),
        n => chain.migrations()[n - 1].name.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SqliteConnection;
    use crate::catalog::{Column, ColumnType, Constraint, Table};
    use crate::dialect::{PostgresDialect, SqliteDialect};
    use crate::migration::{generate, Delta, GenerateOptions};

    fn models() -> Vec<Model> {
        let v1 = Model::new().with_table(
            Table::new("Author")
                .with_column(Column::new("AuthorId", ColumnType::Integer).identity())
                .with_column(Column::new("Name", ColumnType::Text))
                .with_constraint(Constraint::primary_key("pk_Author", ["AuthorId"])),
        );
        let v2 = v1.clone().with_table(
            Table::new("Book")
                .with_column(Column::new("BookId", ColumnType::Integer).identity())
                .with_column(Column::new("AuthorId", ColumnType::Integer))
                .with_constraint(Constraint::primary_key("pk_Book", ["BookId"]))
                .with_constraint(Constraint::foreign_key("fk_Book_Author", "AuthorId", "Author", "AuthorId")),
        );
        vec![v1, v2]
    }

    fn chain() -> MigrationChain {
        let mut chain = MigrationChain::new();
        let mut previous = Model::new();
        for (i, model) in models().into_iter().enumerate() {
            let delta = Delta::compute(&previous, &model).unwrap();
            let migration = generate(&delta, &format!("{:04}_v{}", i + 1, i + 1), &GenerateOptions::new())
                .unwrap()
                .with_parent(chain.head().map(|m| m.name.clone()));
            chain.push(migration).unwrap();
            previous = model;
        }
        chain
    }

    fn runner() -> Runner {
        Runner::new(RunnerConfig::new().with_owner("test"))
    }

    #[test]
    fn test_apply_and_rollback() {
        let chain = chain();
        let mut conn = SqliteConnection::open_in_memory().unwrap();
        let runner = runner();

        let report = runner.apply(&chain, &mut conn).unwrap();
        assert_eq!(report.migrations, vec!["0001_v1", "0002_v2"]);
        assert!(report.states.iter().all(|s| s.status == MigrationStatus::Applied));
        assert!(conn.table_exists("Book").unwrap());
        assert!(runner.apply(&chain, &mut conn).unwrap().is_empty());

        let report = runner.rollback(&chain, &mut conn, RollbackScope::Last(1)).unwrap();
        assert_eq!(report.migrations, vec!["0002_v2"]);
        assert!(!conn.table_exists("Book").unwrap());
        assert!(conn.table_exists("Author").unwrap());

        let status = runner.status(&chain, &mut conn).unwrap();
        assert_eq!(status.pending().count(), 1);
        assert_eq!(status.lock_holder, None);
    }

    #[test]
    fn test_apply_to_target() {
        let chain = chain();
        let mut conn = SqliteConnection::open_in_memory().unwrap();
        let runner = Runner::new(RunnerConfig::new().with_target(Some("0001_v1".into())));

        let report = runner.apply(&chain, &mut conn).unwrap();
        assert_eq!(report.migrations, vec!["0001_v1"]);
        assert!(!conn.table_exists("Book").unwrap());
    }

    #[test]
    fn test_dry_run_touches_nothing() {
        let chain = chain();
        let mut conn = SqliteConnection::open_in_memory().unwrap();
        let runner = Runner::new(RunnerConfig::new().with_dry_run(true));

        let report = runner.apply(&chain, &mut conn).unwrap();
        assert!(report.dry_run);
        assert_eq!(report.migrations.len(), 2);
        assert!(report.script().contains("CREATE TABLE \"Book\""));
        assert!(!conn.table_exists(DEFAULT_LEDGER_TABLE).unwrap());
        assert!(!conn.table_exists(DEFAULT_LOCK_TABLE).unwrap());
        assert!(!conn.table_exists("Author").unwrap());
    }

    #[test]
    fn test_cancel_between_migrations() {
        let chain = chain();
        let mut conn = SqliteConnection::open_in_memory().unwrap();
        let flag = Arc::new(AtomicBool::new(true));
        let runner = Runner::new(RunnerConfig::new().with_cancel_flag(flag));

        let report = runner.apply(&chain, &mut conn).unwrap();
        assert!(report.cancelled);
        assert!(report.is_empty());
    }

    #[test]
    fn test_script_both_directions() {
        let chain = chain();
        let runner = runner();

        let up = runner.script(&chain, None, None, &PostgresDialect).unwrap();
        assert!(up.contains("-- from empty to 0002_v2"));
        assert!(up.contains("ALTER TABLE \"Book\" ADD CONSTRAINT \"fk_Book_Author\""));
        assert_eq!(up.matches("BEGIN;").count(), 2);

        let down = runner
            .script(&chain, Some("0002_v2"), Some("0001_v1"), &PostgresDialect)
            .unwrap();
        assert!(down.contains("-- 0002_v2 (down)"));
        assert!(down.contains("DROP TABLE \"Book\""));
        assert!(down.contains("DELETE FROM \"_strata_ledger\""));
        assert!(!down.contains("0001_v1 (down)"));

        let sqlite = runner.script(&chain, None, None, &SqliteDialect).unwrap();
        assert_eq!(sqlite.matches("PRAGMA foreign_keys = OFF;\nBEGIN;").count(), 2);
        assert_eq!(sqlite.matches("COMMIT;\nPRAGMA foreign_keys = ON;").count(), 2);
        assert!(!up.contains("PRAGMA"));
    }

    #[test]
    fn test_rollback_scope_selection() {
        let chain = chain();
        let names = |targets: Vec<&Migration>| targets.iter().map(|m| m.name.clone()).collect::<Vec<_>>();

        assert_eq!(
            names(select_rollback_targets(&chain, 2, &RollbackScope::All).unwrap()),
            vec!["0002_v2", "0001_v1"]
        );
        assert_eq!(
            names(select_rollback_targets(&chain, 2, &RollbackScope::To("0001_v1".into())).unwrap()),
            vec!["0002_v2"]
        );
        assert!(select_rollback_targets(&chain, 1, &RollbackScope::Last(0)).unwrap().is_empty());
    }
}
