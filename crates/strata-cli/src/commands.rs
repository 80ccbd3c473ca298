//! Subcommand definitions and handlers.

use crate::formatter::Formatter;
use clap::{Args, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Duration;
use strata_core::backend::SqliteConnection;
use strata_core::catalog::Model;
use strata_core::dialect::dialect_by_name;
use strata_core::migration::{GenerateOptions, RenameHints, Resolution, RollbackScope, RunnerConfig};
use strata_core::workspace::Workspace;
use thiserror::Error;
use tracing::info;

/// Errors in command-line arguments.
#[derive(Debug, Error)]
pub enum CliError {
    /// A rename argument was malformed.
    #[error("invalid rename '{value}': expected {expected}")]
    InvalidRename {
        /// The argument as given.
        value: String,
        /// The accepted shape.
        expected: &'static str,
    },

    /// The dialect name is not known.
    #[error("unknown dialect '{0}' (expected postgres or sqlite)")]
    UnknownDialect(String),
}

/// Strata subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Show the operations needed to reach a model
    Diff {
        /// Desired model (JSON)
        model: PathBuf,

        #[command(flatten)]
        renames: RenameArgs,
    },

    /// Generate the next migration towards a model
    Generate {
        /// Desired model (JSON)
        model: PathBuf,

        /// Migration description (lowercase letters, digits and underscores)
        #[arg(short, long)]
        name: String,

        /// Accept operations whose data cannot be restored by rolling back
        #[arg(long)]
        allow_data_loss: bool,

        #[command(flatten)]
        renames: RenameArgs,
    },

    /// Check migration files against snapshots
    Verify,

    /// Show which migrations are applied
    Status {
        #[command(flatten)]
        database: DatabaseArgs,
    },

    /// Apply pending migrations
    Apply {
        #[command(flatten)]
        database: DatabaseArgs,

        /// Stop after this migration
        #[arg(long)]
        target: Option<String>,
    },

    /// Roll back applied migrations
    Rollback {
        #[command(flatten)]
        database: DatabaseArgs,

        /// Number of migrations to roll back
        #[arg(long, default_value_t = 1, conflicts_with_all = ["to", "all"])]
        steps: usize,

        /// Roll back everything applied after this migration
        #[arg(long, conflicts_with = "all")]
        to: Option<String>,

        /// Roll back every applied migration
        #[arg(long)]
        all: bool,
    },

    /// Print the SQL between two migrations without running it
    Script {
        /// Start after this migration (default: empty database)
        #[arg(long)]
        from: Option<String>,

        /// End at this migration (default: latest)
        #[arg(long)]
        to: Option<String>,

        /// SQL dialect
        #[arg(long, default_value = "postgres")]
        dialect: String,
    },

    /// Force-release a stale migration lock
    Unlock {
        /// Target SQLite database
        #[arg(short, long)]
        database: PathBuf,
    },

    /// Settle a partial or inconsistent ledger entry after manual repair
    Resolve {
        /// Target SQLite database
        #[arg(short, long)]
        database: PathBuf,

        /// Migration name
        migration: String,

        /// The schema now matches the migration's target
        #[arg(long, conflicts_with = "forget", required_unless_present = "forget")]
        mark_applied: bool,

        /// The schema now matches the migration's source
        #[arg(long)]
        forget: bool,
    },
}

/// Explicit rename annotations.
#[derive(Args, Debug, Default)]
pub struct RenameArgs {
    /// Rename a table instead of dropping and creating it (OLD=NEW)
    #[arg(long = "rename-table", value_parser = parse_table_rename)]
    pub tables: Vec<(String, String)>,

    /// Rename a column instead of dropping and adding it (TABLE.OLD=NEW)
    #[arg(long = "rename-column", value_parser = parse_column_rename)]
    pub columns: Vec<(String, String, String)>,
}

impl RenameArgs {
    fn hints(&self) -> RenameHints {
        let hints = self
            .tables
            .iter()
            .fold(RenameHints::new(), |h, (from, to)| h.rename_table(from, to));
        self.columns
            .iter()
            .fold(hints, |h, (table, from, to)| h.rename_column(table, from, to))
    }
}

/// Target database and runner settings.
#[derive(Args, Debug)]
pub struct DatabaseArgs {
    /// Target SQLite database
    #[arg(short, long)]
    pub database: PathBuf,

    /// Seconds to wait for the migration lock
    #[arg(long, default_value_t = 30)]
    pub lock_timeout: u64,

    /// Print the statements instead of running them
    #[arg(long)]
    pub dry_run: bool,

    /// Run one operation at a time instead of one transaction per migration
    #[arg(long)]
    pub no_transactional_ddl: bool,
}

impl DatabaseArgs {
    fn config(&self) -> RunnerConfig {
        RunnerConfig::new()
            .with_lock_timeout(Duration::from_secs(self.lock_timeout))
            .with_dry_run(self.dry_run)
    }

    fn connect(&self) -> Result<SqliteConnection, Box<dyn std::error::Error>> {
        let conn = SqliteConnection::open(&self.database)?;
        Ok(conn.with_transactional_ddl(!self.no_transactional_ddl))
    }
}

fn parse_table_rename(value: &str) -> Result<(String, String), CliError> {
    match value.split_once('=') {
        Some((from, to)) if !from.is_empty() && !to.is_empty() => Ok((from.to_string(), to.to_string())),
        _ => Err(CliError::InvalidRename {
            value: value.to_string(),
            expected: "OLD=NEW",
        }),
    }
}

fn parse_column_rename(value: &str) -> Result<(String, String, String), CliError> {
    let invalid = || CliError::InvalidRename {
        value: value.to_string(),
        expected: "TABLE.OLD=NEW",
    };
    let (column, to) = value.split_once('=').ok_or_else(invalid)?;
    let (table, from) = column.split_once('.').ok_or_else(invalid)?;
    if [table, from, to].iter().any(|s| s.is_empty()) {
        return Err(invalid());
    }
    Ok((table.to_string(), from.to_string(), to.to_string()))
}

fn load_model(path: &Path) -> Result<Model, Box<dyn std::error::Error>> {
    let json = std::fs::read_to_string(path)?;
    Ok(Model::from_json(&json)?)
}

/// Run a subcommand and return its formatted output.
pub fn execute(
    command: Command,
    project: &Path,
    formatter: &dyn Formatter,
) -> Result<String, Box<dyn std::error::Error>> {
    let workspace = Workspace::open(project)?;

    let output = match command {
        Command::Diff { model, renames } => {
            let delta = workspace.diff(&load_model(&model)?, &renames.hints())?;
            formatter.format_delta(&delta)
        }
        Command::Generate {
            model,
            name,
            allow_data_loss,
            renames,
        } => {
            let options = GenerateOptions::new().with_allow_data_loss(allow_data_loss);
            let migration = workspace.generate(&load_model(&model)?, &name, &renames.hints(), &options)?;
            formatter.format_migration(&migration)
        }
        Command::Verify => {
            let chain = workspace.verify()?;
            formatter.format_message(&format!("{} migration(s) verified", chain.len()))
        }
        Command::Status { database } => {
            let workspace = workspace.with_config(database.config());
            let status = workspace.status(&mut database.connect()?)?;
            formatter.format_status(&status)
        }
        Command::Apply { database, target } => {
            let workspace = workspace.with_config(database.config().with_target(target));
            let report = workspace.apply(&mut database.connect()?)?;
            formatter.format_run(&report)
        }
        Command::Rollback {
            database,
            steps,
            to,
            all,
        } => {
            let scope = match (all, to) {
                (true, _) => RollbackScope::All,
                (false, Some(name)) => RollbackScope::To(name),
                (false, None) => RollbackScope::Last(steps),
            };
            let workspace = workspace.with_config(database.config());
            let report = workspace.rollback(&mut database.connect()?, scope)?;
            formatter.format_run(&report)
        }
        Command::Script { from, to, dialect } => {
            let dialect = dialect_by_name(&dialect).ok_or(CliError::UnknownDialect(dialect))?;
            workspace.script(from.as_deref(), to.as_deref(), dialect)?
        }
        Command::Unlock { database } => {
            let mut conn = SqliteConnection::open(&database)?;
            match workspace.unlock(&mut conn)? {
                Some(holder) => {
                    info!(%holder, "lock released");
                    formatter.format_message(&format!("Released lock held by {}", holder))
                }
                None => formatter.format_message("Lock was not held"),
            }
        }
        Command::Resolve {
            database,
            migration,
            mark_applied,
            forget: _,
        } => {
            let resolution = if mark_applied {
                Resolution::MarkApplied
            } else {
                Resolution::Forget
            };
            let mut conn = SqliteConnection::open(&database)?;
            workspace.resolve(&mut conn, &migration, resolution)?;
            formatter.format_message(&format!("Resolved {} ({:?})", migration, resolution))
        }
    };
    Ok(output)
}
