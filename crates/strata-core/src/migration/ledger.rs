//! The record, inside the target database, of applied migrations.

use super::chain::MigrationChain;
use super::error::MigrationError;
use super::generator::Migration;
use super::state::MigrationStatus;
use crate::backend::{Connection, Row};
use crate::dialect::{quote_ident, quote_literal};
use crate::error::Error;
use crate::storage::current_timestamp;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Default ledger table name.
pub const DEFAULT_LEDGER_TABLE: &str = "_strata_ledger";

/// State of a ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerState {
    /// Every operation ran.
    Applied,
    /// A non-transactional run stopped part way.
    Partial,
    /// A rollback failed.
    Inconsistent,
}

impl LedgerState {
    /// Storage name.
    pub fn as_str(self) -> &'static str {
        match self {
            LedgerState::Applied => "applied",
            LedgerState::Partial => "partial",
            LedgerState::Inconsistent => "inconsistent",
        }
    }

    /// Parse a storage name.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "applied" => Some(LedgerState::Applied),
            "partial" => Some(LedgerState::Partial),
            "inconsistent" => Some(LedgerState::Inconsistent),
            _ => None,
        }
    }

    /// Equivalent migration status.
    pub fn status(self) -> MigrationStatus {
        match self {
            LedgerState::Applied => MigrationStatus::Applied,
            LedgerState::Partial => MigrationStatus::Partial,
            LedgerState::Inconsistent => MigrationStatus::Inconsistent,
        }
    }
}

impl std::fmt::Display for LedgerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Migration sequence.
    pub sequence: u32,
    /// Migration name.
    pub name: String,
    /// Migration checksum at the time it was applied.
    pub checksum: String,
    /// Entry state.
    pub state: LedgerState,
    /// Number of `up` operations that ran.
    pub operations_applied: usize,
    /// When the entry was last written (microseconds since epoch).
    pub applied_at: u64,
}

impl LedgerEntry {
    fn from_row(row: &Row) -> Result<Self, Error> {
        if row.len() != 6 {
            return Err(Error::InvalidData(format!(
                "ledger row has {} columns, expected 6",
                row.len()
            )));
        }
        let text = |i: usize| {
            row[i]
                .clone()
                .ok_or_else(|| Error::InvalidData(format!("ledger column {} is NULL", i)))
        };
        let number = |i: usize| -> Result<u64, Error> {
            let value = text(i)?;
            value
                .parse()
                .map_err(|_| Error::InvalidData(format!("ledger column {} is not a number: {}", i, value)))
        };

        let out_of_range = |i: usize, value: u64| {
            Error::InvalidData(format!("ledger column {} is out of range: {}", i, value))
        };
        let sequence = number(0)?;
        let operations_applied = number(4)?;

        let state = text(3)?;
        Ok(Self {
            sequence: u32::try_from(sequence).map_err(|_| out_of_range(0, sequence))?,
            name: text(1)?,
            checksum: text(2)?,
            state: LedgerState::parse(&state)
                .ok_or_else(|| Error::InvalidData(format!("unknown ledger state '{}'", state)))?,
            operations_applied: usize::try_from(operations_applied)
                .map_err(|_| out_of_range(4, operations_applied))?,
            applied_at: number(5)?,
        })
    }
}

/// What an operator decided about a partial or inconsistent entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The schema was brought to the migration's target by hand.
    MarkApplied,
    /// The schema was brought back to the migration's source by hand.
    Forget,
}

/// Reads and writes the ledger table.
#[derive(Debug, Clone)]
pub struct Ledger {
    table: String,
}

impl Default for Ledger {
    fn default() -> Self {
        Self::new(DEFAULT_LEDGER_TABLE)
    }
}

impl Ledger {
    /// Create a ledger stored in `table`.
    pub fn new(table: impl Into<String>) -> Self {
        Self { table: table.into() }
    }

    /// Ledger table name.
    pub fn table(&self) -> &str {
        &self.table
    }

    /// `CREATE TABLE` statement for the ledger.
    pub fn create_statement(&self) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\"sequence\" INTEGER NOT NULL PRIMARY KEY, \"name\" TEXT NOT NULL UNIQUE, \"checksum\" TEXT NOT NULL, \"state\" TEXT NOT NULL, \"operations_applied\" INTEGER NOT NULL, \"applied_at\" BIGINT NOT NULL)",
            quote_ident(&self.table)
        )
    }

    /// Statement writing the entry for `migration`.
    pub fn upsert_statement(
        &self,
        migration: &Migration,
        state: LedgerState,
        operations_applied: usize,
        applied_at: u64,
    ) -> String {
        format!(
            "INSERT INTO {} (\"sequence\", \"name\", \"checksum\", \"state\", \"operations_applied\", \"applied_at\") VALUES ({}, {}, {}, {}, {}, {}) ON CONFLICT (\"sequence\") DO UPDATE SET \"name\" = excluded.\"name\", \"checksum\" = excluded.\"checksum\", \"state\" = excluded.\"state\", \"operations_applied\" = excluded.\"operations_applied\", \"applied_at\" = excluded.\"applied_at\"",
            quote_ident(&self.table),
            migration.sequence,
            quote_literal(&migration.name),
            quote_literal(&migration.checksum),
            quote_literal(state.as_str()),
            operations_applied,
            applied_at
        )
    }

    /// Statement removing the entry for `migration`.
    pub fn delete_statement(&self, migration: &Migration) -> String {
        format!(
            "DELETE FROM {} WHERE \"name\" = {}",
            quote_ident(&self.table),
            quote_literal(&migration.name)
        )
    }

    /// Create the ledger table if it is missing.
    pub fn ensure_table(&self, conn: &mut dyn Connection) -> Result<(), MigrationError> {
        conn.execute(&self.create_statement())?;
        Ok(())
    }

    /// All entries, in sequence order. Empty when the table does not exist.
    pub fn entries(&self, conn: &mut dyn Connection) -> Result<Vec<LedgerEntry>, MigrationError> {
        if !conn.table_exists(&self.table)? {
            return Ok(Vec::new());
        }
        let rows = conn.query(&format!(
            "SELECT \"sequence\", \"name\", \"checksum\", \"state\", \"operations_applied\", \"applied_at\" FROM {} ORDER BY \"sequence\"",
            quote_ident(&self.table)
        ))?;
        let entries = rows
            .iter()
            .map(LedgerEntry::from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    /// Record `migration` as fully applied.
    pub fn record(&self, conn: &mut dyn Connection, migration: &Migration) -> Result<(), MigrationError> {
        let statement = self.upsert_statement(
            migration,
            LedgerState::Applied,
            migration.up.len(),
            current_timestamp(),
        );
        conn.execute(&statement)?;
        Ok(())
    }

    /// Record that the first `operations_applied` operations of `migration`
    /// ran on a non-transactional backend.
    pub fn record_progress(
        &self,
        conn: &mut dyn Connection,
        migration: &Migration,
        operations_applied: usize,
    ) -> Result<(), MigrationError> {
        let statement = self.upsert_statement(
            migration,
            LedgerState::Partial,
            operations_applied,
            current_timestamp(),
        );
        conn.execute(&statement)?;
        Ok(())
    }

    /// Flag `migration` as needing manual repair after a failed rollback.
    pub fn mark_inconsistent(
        &self,
        conn: &mut dyn Connection,
        migration: &Migration,
    ) -> Result<(), MigrationError> {
        let statement = self.upsert_statement(
            migration,
            LedgerState::Inconsistent,
            migration.up.len(),
            current_timestamp(),
        );
        conn.execute(&statement)?;
        Ok(())
    }

    /// Remove the entry for `migration`.
    pub fn unrecord(&self, conn: &mut dyn Connection, migration: &Migration) -> Result<(), MigrationError> {
        conn.execute(&self.delete_statement(migration))?;
        Ok(())
    }

    /// Migrations of `chain` not yet applied, in chain order.
    pub fn pending<'c>(
        &self,
        conn: &mut dyn Connection,
        chain: &'c MigrationChain,
    ) -> Result<Vec<&'c Migration>, MigrationError> {
        let entries = self.entries(conn)?;
        pending_from(&entries, chain)
    }

    /// Settle a partial or inconsistent entry after manual repair.
    pub fn resolve(
        &self,
        conn: &mut dyn Connection,
        chain: &MigrationChain,
        name: &str,
        resolution: Resolution,
    ) -> Result<(), MigrationError> {
        let migration = chain.require(name)?;
        let entries = self.entries(conn)?;
        let entry = entries
            .iter()
            .find(|e| e.name == name)
            .ok_or_else(|| MigrationError::InvalidOperation {
                operation: format!("resolve {}", name),
                message: "migration has no ledger entry".to_string(),
            })?;
        if entry.state == LedgerState::Applied {
            return Err(MigrationError::InvalidOperation {
                operation: format!("resolve {}", name),
                message: "entry is already applied".to_string(),
            });
        }

        match resolution {
            Resolution::MarkApplied => self.record(conn, migration)?,
            Resolution::Forget => self.unrecord(conn, migration)?,
        }
        info!(migration = %name, from = %entry.state, ?resolution, "ledger entry resolved");
        Ok(())
    }
}

/// Check `entries` against `chain` and return the unapplied remainder.
///
/// Recorded entries must be a prefix of the chain with matching checksums,
/// and none may be partial or inconsistent.
pub fn pending_from<'c>(
    entries: &[LedgerEntry],
    chain: &'c MigrationChain,
) -> Result<Vec<&'c Migration>, MigrationError> {
    verify_entries(entries, chain)?;
    for entry in entries {
        let migration = chain.require(&entry.name)?;
        match entry.state {
            LedgerState::Applied => {}
            LedgerState::Partial => {
                return Err(MigrationError::PartialApply {
                    migration: entry.name.clone(),
                    completed: migration
                        .up
                        .iter()
                        .take(entry.operations_applied)
                        .map(|op| op.to_string())
                        .collect(),
                    total: migration.up.len(),
                    message: "resolve the entry before running further migrations".to_string(),
                });
            }
            LedgerState::Inconsistent => {
                return Err(MigrationError::InconsistentState {
                    migration: entry.name.clone(),
                    message: "rollback failed; resolve the entry before running further migrations"
                        .to_string(),
                });
            }
        }
    }
    Ok(chain.migrations()[entries.len()..].iter().collect())
}

/// Check that `entries` are a checksum-matching prefix of `chain`.
pub fn verify_entries(entries: &[LedgerEntry], chain: &MigrationChain) -> Result<(), MigrationError> {
    for (i, entry) in entries.iter().enumerate() {
        let Some(migration) = chain.get(&entry.name) else {
            return Err(MigrationError::LedgerDiverged {
                migration: entry.name.clone(),
                message: "applied migration is not present in the migration chain".to_string(),
            });
        };
        if entry.sequence != migration.sequence || migration.sequence as usize != i + 1 {
            return Err(MigrationError::LedgerDiverged {
                migration: entry.name.clone(),
                message: format!(
                    "recorded at position {} with sequence {}, but the chain has it at sequence {}",
                    i + 1,
                    entry.sequence,
                    migration.sequence
                ),
            });
        }
        if entry.checksum != migration.checksum {
            return Err(MigrationError::SchemaConflict {
                message: format!(
                    "migration {} changed after it was applied (checksum {} != {})",
                    entry.name, migration.checksum, entry.checksum
                ),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SqliteConnection;
    use crate::catalog::{Column, ColumnType, Model, Table};
    use crate::migration::{generate, Delta, GenerateOptions};

    fn chain() -> MigrationChain {
        let mut chain = MigrationChain::new();
        let mut model = Model::new();
        for (i, table) in ["Author", "Book", "Review"].iter().enumerate() {
            let next = model
                .clone()
                .with_table(Table::new(*table).with_column(Column::new("Id", ColumnType::Integer)));
            let delta = Delta::compute(&model, &next).unwrap();
            let name = format!("{:04}_add_{}", i + 1, table.to_lowercase());
            let migration = generate(&delta, &name, &GenerateOptions::new())
                .unwrap()
                .with_parent(chain.head().map(|m| m.name.clone()));
            chain.push(migration).unwrap();
            model = next;
        }
        chain
    }

    fn setup() -> (SqliteConnection, Ledger, MigrationChain) {
        let mut conn = SqliteConnection::open_in_memory().unwrap();
        let ledger = Ledger::default();
        ledger.ensure_table(&mut conn).unwrap();
        (conn, ledger, chain())
    }

    #[test]
    fn test_pending_excludes_recorded() {
        let (mut conn, ledger, chain) = setup();
        assert_eq!(ledger.pending(&mut conn, &chain).unwrap().len(), 3);

        ledger.record(&mut conn, &chain.migrations()[0]).unwrap();
        let pending = ledger.pending(&mut conn, &chain).unwrap();

        let names: Vec<&str> = pending.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["0002_add_book", "0003_add_review"]);
    }

    #[test]
    fn test_entries_roundtrip() {
        let (mut conn, ledger, chain) = setup();
        ledger.record(&mut conn, &chain.migrations()[0]).unwrap();

        let entries = ledger.entries(&mut conn).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "0001_add_author");
        assert_eq!(entries[0].state, LedgerState::Applied);
        assert_eq!(entries[0].operations_applied, 1);
        assert!(entries[0].applied_at > 0);

        ledger.unrecord(&mut conn, &chain.migrations()[0]).unwrap();
        assert!(ledger.entries(&mut conn).unwrap().is_empty());
    }

    #[test]
    fn test_missing_table_reads_as_empty() {
        let mut conn = SqliteConnection::open_in_memory().unwrap();
        let ledger = Ledger::new("custom_ledger");

        assert!(ledger.entries(&mut conn).unwrap().is_empty());
        assert!(!conn.table_exists("custom_ledger").unwrap());
    }

    #[test]
    fn test_unknown_migration_diverges() {
        let (mut conn, ledger, chain) = setup();
        conn.execute(&format!(
            "INSERT INTO \"{}\" VALUES (1, '0001_from_other_branch', 'x', 'applied', 1, 0)",
            DEFAULT_LEDGER_TABLE
        ))
        .unwrap();

        match ledger.pending(&mut conn, &chain) {
            Err(MigrationError::LedgerDiverged { migration, .. }) => {
                assert_eq!(migration, "0001_from_other_branch");
            }
            other => panic!("Expected LedgerDiverged, got {:?}", other),
        }
    }

    #[test]
    fn test_gap_diverges() {
        let (mut conn, ledger, chain) = setup();
        ledger.record(&mut conn, &chain.migrations()[1]).unwrap();

        assert!(matches!(
            ledger.pending(&mut conn, &chain),
            Err(MigrationError::LedgerDiverged { .. })
        ));
    }

    #[test]
    fn test_checksum_mismatch_conflicts() {
        let (mut conn, ledger, chain) = setup();
        let mut edited = chain.migrations()[0].clone();
        edited.checksum = "0000".into();
        ledger.record(&mut conn, &edited).unwrap();

        assert!(matches!(
            ledger.pending(&mut conn, &chain),
            Err(MigrationError::SchemaConflict { .. })
        ));
    }

    #[test]
    fn test_partial_entry_blocks_until_resolved() {
        let (mut conn, ledger, chain) = setup();
        ledger.record(&mut conn, &chain.migrations()[0]).unwrap();
        ledger.record_progress(&mut conn, &chain.migrations()[1], 0).unwrap();

        let err = ledger.pending(&mut conn, &chain).unwrap_err();
        assert!(matches!(err, MigrationError::PartialApply { .. }));
        assert!(err.requires_intervention());

        ledger
            .resolve(&mut conn, &chain, "0002_add_book", Resolution::Forget)
            .unwrap();
        assert_eq!(ledger.pending(&mut conn, &chain).unwrap().len(), 2);
    }

    #[test]
    fn test_inconsistent_entry_blocks_until_resolved() {
        let (mut conn, ledger, chain) = setup();
        ledger.record(&mut conn, &chain.migrations()[0]).unwrap();
        ledger.mark_inconsistent(&mut conn, &chain.migrations()[0]).unwrap();

        assert!(matches!(
            ledger.pending(&mut conn, &chain),
            Err(MigrationError::InconsistentState { .. })
        ));

        ledger
            .resolve(&mut conn, &chain, "0001_add_author", Resolution::MarkApplied)
            .unwrap();
        assert_eq!(ledger.pending(&mut conn, &chain).unwrap().len(), 2);

        let err = ledger
            .resolve(&mut conn, &chain, "0001_add_author", Resolution::MarkApplied)
            .unwrap_err();
        assert!(matches!(err, MigrationError::InvalidOperation { .. }));
    }

    #[test]
    fn test_entry_rejects_out_of_range_numbers() {
        let row = |sequence: &str| -> Row {
            vec![
                Some(sequence.to_string()),
                Some("0001_add_author".into()),
                Some("abc".into()),
                Some("applied".into()),
                Some("1".into()),
                Some("0".into()),
            ]
        };

        assert_eq!(LedgerEntry::from_row(&row("1")).unwrap().sequence, 1);
        match LedgerEntry::from_row(&row("4294967297")) {
            Err(Error::InvalidData(message)) => assert!(message.contains("out of range")),
            other => panic!("Expected InvalidData, got {:?}", other),
        }
    }
}
