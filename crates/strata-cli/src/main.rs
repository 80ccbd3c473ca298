//! Strata Command-Line Client
//!
//! Generates, applies and rolls back schema migrations for a project
//! directory.

mod commands;
mod formatter;

use clap::Parser;
use commands::Command;
use formatter::OutputFormat;
use std::path::PathBuf;

/// Strata schema migrations
#[derive(Parser, Debug)]
#[command(name = "strata")]
#[command(version, about = "Strata schema migrations")]
pub struct Args {
    /// Project directory (holds snapshots/ and migrations/)
    #[arg(short, long, default_value = ".", global = true)]
    pub project: PathBuf,

    /// Output format
    #[arg(long, default_value = "table", value_enum, global = true)]
    pub format: OutputFormat,

    #[command(subcommand)]
    pub command: Command,
}

fn main() {
    // Initialize tracing; stdout is reserved for command output.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("strata=info".parse().unwrap()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    if let Err(e) = run(args) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let formatter = formatter::create_formatter(args.format);
    let output = commands::execute(args.command, &args.project, &*formatter)?;
    if !output.is_empty() {
        println!("{}", output);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_args_are_consistent() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_parse_rollback() {
        let args = Args::try_parse_from([
            "strata", "--project", "app", "rollback", "--database", "app.db", "--to", "0001_init",
        ])
        .unwrap();
        match args.command {
            Command::Rollback { to, all, .. } => {
                assert_eq!(to.as_deref(), Some("0001_init"));
                assert!(!all);
            }
            other => panic!("Expected Rollback, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_renames() {
        let args = Args::try_parse_from([
            "strata",
            "generate",
            "model.json",
            "--name",
            "rename_author",
            "--rename-table",
            "Author=Writer",
            "--rename-column",
            "Writer.Name=FullName",
        ])
        .unwrap();
        match args.command {
            Command::Generate { renames, .. } => {
                assert_eq!(renames.tables, vec![("Author".to_string(), "Writer".to_string())]);
                assert_eq!(renames.columns.len(), 1);
            }
            other => panic!("Expected Generate, got {:?}", other),
        }
    }
}
