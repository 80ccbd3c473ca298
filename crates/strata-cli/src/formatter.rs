//! Output formatters for command results.

use clap::ValueEnum;
use comfy_table::{Cell, Table};
use strata_core::migration::{Delta, Migration, RunReport, StatusReport};

/// Output format for results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// ASCII table format
    Table,
    /// JSON format
    Json,
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputFormat::Table => write!(f, "table"),
            OutputFormat::Json => write!(f, "json"),
        }
    }
}

/// Trait for formatting output.
pub trait Formatter {
    /// Format a computed delta.
    fn format_delta(&self, delta: &Delta) -> String;

    /// Format a generated migration.
    fn format_migration(&self, migration: &Migration) -> String;

    /// Format migration status.
    fn format_status(&self, status: &StatusReport) -> String;

    /// Format the outcome of an apply or rollback.
    fn format_run(&self, report: &RunReport) -> String;

    /// Format a simple message.
    fn format_message(&self, message: &str) -> String;
}

/// Create a formatter for the given output format.
pub fn create_formatter(format: OutputFormat) -> Box<dyn Formatter> {
    match format {
        OutputFormat::Table => Box::new(TableFormatter),
        OutputFormat::Json => Box::new(JsonFormatter),
    }
}

/// Render a ledger timestamp (microseconds since epoch).
fn format_timestamp(micros: u64) -> String {
    chrono::DateTime::from_timestamp_micros(micros as i64)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| micros.to_string())
}

/// Table formatter using comfy-table.
pub struct TableFormatter;

impl Formatter for TableFormatter {
    fn format_delta(&self, delta: &Delta) -> String {
        if delta.is_empty() {
            return "No changes".to_string();
        }
        let mut table = Table::new();
        table.set_header(vec!["#", "Operation", "Reversible"]);
        for (i, op) in delta.operations.iter().enumerate() {
            table.add_row(vec![
                Cell::new(i + 1),
                Cell::new(op),
                Cell::new(if op.data_loss().is_some() { "no" } else { "yes" }),
            ]);
        }
        table.to_string()
    }

    fn format_migration(&self, migration: &Migration) -> String {
        let mut output = format!(
            "Generated {} ({} operation(s))",
            migration.name,
            migration.up.len()
        );
        for loss in &migration.data_loss {
            output.push_str(&format!("\n  data loss acknowledged: {}", loss));
        }
        output
    }

    fn format_status(&self, status: &StatusReport) -> String {
        let mut table = Table::new();
        table.set_header(vec!["Migration", "Status", "Operations", "Applied At"]);
        for row in &status.rows {
            let operations = if row.operations_applied == row.operations || row.operations_applied == 0 {
                row.operations.to_string()
            } else {
                format!("{}/{}", row.operations_applied, row.operations)
            };
            table.add_row(vec![
                Cell::new(&row.name),
                Cell::new(row.status),
                Cell::new(operations),
                Cell::new(row.applied_at.map(format_timestamp).unwrap_or_default()),
            ]);
        }

        let mut output = if status.rows.is_empty() {
            "No migrations".to_string()
        } else {
            table.to_string()
        };
        if let Some(holder) = &status.lock_holder {
            output.push_str(&format!("\nMigration lock held by {}", holder));
        }
        output
    }

    fn format_run(&self, report: &RunReport) -> String {
        if report.dry_run {
            if report.steps.is_empty() {
                return "Nothing to do".to_string();
            }
            return report.script();
        }

        let verb = match report.direction {
            strata_core::migration::Direction::Up => "Applied",
            strata_core::migration::Direction::Down => "Rolled back",
        };
        let mut output = if report.is_empty() {
            "Nothing to do".to_string()
        } else {
            let mut lines = vec![format!("{} {} migration(s):", verb, report.migrations.len())];
            lines.extend(report.migrations.iter().map(|m| format!("  {}", m)));
            lines.join("\n")
        };
        if report.cancelled {
            output.push_str("\nStopped early: cancelled");
        }
        output
    }

    fn format_message(&self, message: &str) -> String {
        message.to_string()
    }
}

/// JSON formatter.
pub struct JsonFormatter;

impl JsonFormatter {
    fn to_json<T: serde::Serialize>(value: &T) -> String {
        serde_json::to_string_pretty(value).unwrap_or_else(|e| {
            serde_json::json!({ "error": e.to_string() }).to_string()
        })
    }
}

impl Formatter for JsonFormatter {
    fn format_delta(&self, delta: &Delta) -> String {
        Self::to_json(delta)
    }

    fn format_migration(&self, migration: &Migration) -> String {
        Self::to_json(migration)
    }

    fn format_status(&self, status: &StatusReport) -> String {
        Self::to_json(status)
    }

    fn format_run(&self, report: &RunReport) -> String {
        Self::to_json(report)
    }

    fn format_message(&self, message: &str) -> String {
        serde_json::json!({
            "message": message
        })
        .to_string()
    }
}
