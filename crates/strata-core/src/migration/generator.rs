//! Migration generation.
//!
//! Turns a [`Delta`] into a [`Migration`] carrying both directions.

use super::diff::Delta;
use super::error::MigrationError;
use super::operation::Operation;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Options controlling migration generation.
#[derive(Debug, Clone, Default)]
pub struct GenerateOptions {
    /// Accept operations whose inverse cannot restore data.
    pub allow_data_loss: bool,
}

impl GenerateOptions {
    /// Create default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set whether data loss is acknowledged.
    pub fn with_allow_data_loss(mut self, allow: bool) -> Self {
        self.allow_data_loss = allow;
        self
    }
}

/// A parsed `<sequence>_<description>` migration name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationName {
    /// Position in the chain, starting at 1.
    pub sequence: u32,
    /// Lowercase description.
    pub description: String,
}

impl MigrationName {
    /// Build a name from its parts, formatting the sequence as four digits.
    pub fn new(sequence: u32, description: &str) -> Result<Self, MigrationError> {
        Self::parse(&format!("{:04}_{}", sequence, description))
    }

    /// Parse and validate a migration name.
    pub fn parse(name: &str) -> Result<Self, MigrationError> {
        let invalid = |reason: &str| MigrationError::InvalidMigrationName {
            name: name.to_string(),
            reason: reason.to_string(),
        };

        let (sequence, description) = name
            .split_once('_')
            .ok_or_else(|| invalid("expected <sequence>_<description>"))?;
        if sequence.is_empty() || !sequence.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid("sequence must be decimal digits"));
        }
        let sequence: u32 = sequence
            .parse()
            .map_err(|_| invalid("sequence is out of range"))?;
        if sequence == 0 {
            return Err(invalid("sequence starts at 1"));
        }
        if description.is_empty() {
            return Err(invalid("description is empty"));
        }
        let allowed = |c: char| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_';
        if !description.chars().all(allowed) {
            return Err(invalid(
                "description may only contain lowercase letters, digits and underscores",
            ));
        }

        Ok(Self {
            sequence,
            description: description.to_string(),
        })
    }
}

impl std::fmt::Display for MigrationName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:04}_{}", self.sequence, self.description)
    }
}

/// A named, reversible set of operations linked to its predecessor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Migration {
    /// `<sequence>_<description>`.
    pub name: String,
    /// Position in the chain, starting at 1.
    pub sequence: u32,
    /// Name of the preceding migration, `None` for the first.
    pub parent: Option<String>,
    /// Content hash of the model this migration starts from.
    pub from_hash: String,
    /// Content hash of the model this migration produces.
    pub to_hash: String,
    /// Checksum over `up` and `down`.
    pub checksum: String,
    /// Operations whose data loss was acknowledged at generation time.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub data_loss: Vec<String>,
    /// Forward operations.
    pub up: Vec<Operation>,
    /// Reverse operations.
    pub down: Vec<Operation>,
}

impl Migration {
    /// Link this migration to its predecessor.
    pub fn with_parent(mut self, parent: Option<String>) -> Self {
        self.parent = parent;
        self
    }

    /// Checksum over a pair of operation lists.
    pub fn compute_checksum(up: &[Operation], down: &[Operation]) -> String {
        let mut hasher = blake3::Hasher::new();
        // Writes into a hasher never fail and operations hold only strings,
        // numbers and string-keyed maps.
        serde_json::to_writer(&mut hasher, &(up, down)).expect("operation serialization is infallible");
        hex::encode(hasher.finalize().as_bytes())
    }

    /// Check the stored checksum against the operations.
    pub fn verify_checksum(&self) -> Result<(), MigrationError> {
        let actual = Self::compute_checksum(&self.up, &self.down);
        if actual != self.checksum {
            return Err(MigrationError::SchemaConflict {
                message: format!(
                    "migration {} was edited after generation (checksum {} != {})",
                    self.name, actual, self.checksum
                ),
            });
        }
        Ok(())
    }

    /// Whether running `down` restores everything `up` changed.
    pub fn is_lossless(&self) -> bool {
        self.data_loss.is_empty()
    }

    /// Parsed name.
    pub fn parsed_name(&self) -> Result<MigrationName, MigrationError> {
        MigrationName::parse(&self.name)
    }
}

/// Generate a migration from a delta.
///
/// `down` is the inverse of each `up` operation, in reverse order. Fails
/// with [`MigrationError::IrreversibleChange`] when an operation destroys
/// data, unless [`GenerateOptions::allow_data_loss`] is set.
pub fn generate(
    delta: &Delta,
    name: &str,
    options: &GenerateOptions,
) -> Result<Migration, MigrationError> {
    let parsed = MigrationName::parse(name)?;
    if delta.is_empty() {
        return Err(MigrationError::NoChanges {
            from_hash: delta.from_hash.clone(),
            to_hash: delta.to_hash.clone(),
        });
    }

    let mut data_loss = Vec::new();
    for operation in &delta.operations {
        if let Some(reason) = operation.data_loss() {
            if !options.allow_data_loss {
                return Err(MigrationError::IrreversibleChange {
                    operation: operation.to_string(),
                    reason: reason.to_string(),
                });
            }
            warn!(migration = %parsed, operation = %operation, reason, "data loss acknowledged");
            data_loss.push(operation.to_string());
        }
    }

    let up = delta.operations.clone();
    let down: Vec<Operation> = up.iter().rev().filter_map(Operation::inverse).collect();
    let checksum = Migration::compute_checksum(&up, &down);

    Ok(Migration {
        name: parsed.to_string(),
        sequence: parsed.sequence,
        parent: None,
        from_hash: delta.from_hash.clone(),
        to_hash: delta.to_hash.clone(),
        checksum,
        data_loss,
        up,
        down,
    })
}
