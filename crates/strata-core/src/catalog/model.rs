//! Schema model - the desired or current shape of a database.

use super::{Constraint, ConstraintKind, Table};
use crate::migration::MigrationError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// A relational schema: a set of tables keyed by name.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Model {
    /// Table definitions keyed by name.
    #[serde(default)]
    pub tables: BTreeMap<String, Table>,
}

impl Model {
    /// Create an empty model.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a table to the model.
    pub fn with_table(mut self, table: Table) -> Self {
        self.tables.insert(table.name.clone(), table);
        self
    }

    /// Get a table by name.
    pub fn table(&self, name: &str) -> Option<&Table> {
        self.tables.get(name)
    }

    /// Get a table by name (mutable).
    pub fn table_mut(&mut self, name: &str) -> Option<&mut Table> {
        self.tables.get_mut(name)
    }

    /// List all table names, sorted.
    pub fn table_names(&self) -> Vec<&str> {
        self.tables.keys().map(|s| s.as_str()).collect()
    }

    /// Check if the model has no tables.
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Foreign keys anywhere in the model that reference `table`, as
    /// `(owning table, constraint)` pairs.
    pub fn references_to(&self, table: &str) -> Vec<(&str, &Constraint)> {
        self.tables
            .values()
            .flat_map(|t| t.foreign_keys().map(move |fk| (t.name.as_str(), fk)))
            .filter(|(_, fk)| fk.referenced_table() == Some(table))
            .collect()
    }

    /// Content hash of the model (blake3 over the canonical JSON encoding).
    ///
    /// All collections are ordered maps or ordered vectors, so equal models
    /// always hash equally.
    pub fn content_hash(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        // Writes into a hasher never fail and every map in a model is keyed by
        // a string, so serialization cannot error.
        serde_json::to_writer(&mut hasher, self).expect("model serialization is infallible");
        hex::encode(hasher.finalize().as_bytes())
    }

    /// Check the model's internal consistency.
    pub fn validate(&self) -> Result<(), MigrationError> {
        for (key, table) in &self.tables {
            if key != &table.name {
                return Err(invalid(format!(
                    "table keyed as '{}' is named '{}'",
                    key, table.name
                )));
            }
            if table.name.is_empty() {
                return Err(invalid("table name must not be empty"));
            }
            self.validate_table(table)?;
        }
        Ok(())
    }

    fn validate_table(&self, table: &Table) -> Result<(), MigrationError> {
        let mut seen = HashSet::new();
        for column in &table.columns {
            if column.name.is_empty() {
                return Err(invalid(format!("table '{}' has an unnamed column", table.name)));
            }
            if !seen.insert(column.name.as_str()) {
                return Err(invalid(format!(
                    "duplicate column '{}.{}'",
                    table.name, column.name
                )));
            }
        }

        let mut primary_keys = 0;
        for (key, constraint) in &table.constraints {
            if key != &constraint.name {
                return Err(invalid(format!(
                    "constraint keyed as '{}' on '{}' is named '{}'",
                    key, table.name, constraint.name
                )));
            }
            for column in &constraint.columns {
                if !table.has_column(column) {
                    return Err(invalid(format!(
                        "constraint '{}' references unknown column '{}.{}'",
                        constraint.name, table.name, column
                    )));
                }
            }
            match &constraint.kind {
                ConstraintKind::PrimaryKey => {
                    primary_keys += 1;
                    if constraint.columns.is_empty() {
                        return Err(invalid(format!(
                            "primary key '{}' has no columns",
                            constraint.name
                        )));
                    }
                }
                ConstraintKind::Unique if constraint.columns.is_empty() => {
                    return Err(invalid(format!(
                        "unique constraint '{}' has no columns",
                        constraint.name
                    )));
                }
                ConstraintKind::ForeignKey {
                    references_table,
                    references_columns,
                    ..
                } => {
                    let target = self.table(references_table).ok_or_else(|| {
                        invalid(format!(
                            "foreign key '{}' references unknown table '{}'",
                            constraint.name, references_table
                        ))
                    })?;
                    if references_columns.len() != constraint.columns.len()
                        || constraint.columns.is_empty()
                    {
                        return Err(invalid(format!(
                            "foreign key '{}' has mismatched column lists",
                            constraint.name
                        )));
                    }
                    for column in references_columns {
                        if !target.has_column(column) {
                            return Err(invalid(format!(
                                "foreign key '{}' references unknown column '{}.{}'",
                                constraint.name, references_table, column
                            )));
                        }
                    }
                }
                _ => {}
            }
        }
        if primary_keys > 1 {
            return Err(invalid(format!(
                "table '{}' declares more than one primary key",
                table.name
            )));
        }

        for (key, index) in &table.indexes {
            if key != &index.name {
                return Err(invalid(format!(
                    "index keyed as '{}' on '{}' is named '{}'",
                    key, table.name, index.name
                )));
            }
            if index.columns.is_empty() {
                return Err(invalid(format!("index '{}' has no columns", index.name)));
            }
            for column in &index.columns {
                if !table.has_column(column) {
                    return Err(invalid(format!(
                        "index '{}' references unknown column '{}.{}'",
                        index.name, table.name, column
                    )));
                }
            }
        }
        Ok(())
    }

    /// Serialize the model to pretty-printed JSON.
    pub fn to_json(&self) -> Result<String, MigrationError> {
        serde_json::to_string_pretty(self).map_err(|e| MigrationError::Serialization(e.to_string()))
    }

    /// Deserialize and validate a model from JSON.
    pub fn from_json(json: &str) -> Result<Self, MigrationError> {
        let model: Model = serde_json::from_str(json)
            .map_err(|e| MigrationError::Deserialization(e.to_string()))?;
        model.validate()?;
        Ok(model)
    }
}

fn invalid(message: impl Into<String>) -> MigrationError {
    MigrationError::InvalidModel {
        message: message.into(),
    }
}
