//! Table definitions.

use super::{Column, Constraint, Index};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// A table definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Table {
    /// Table name (unique within the model).
    pub name: String,
    /// Columns, in declaration order.
    pub columns: Vec<Column>,
    /// Constraints keyed by constraint name.
    #[serde(default)]
    pub constraints: BTreeMap<String, Constraint>,
    /// Indexes keyed by index name.
    #[serde(default)]
    pub indexes: BTreeMap<String, Index>,
}

impl Table {
    /// Create an empty table definition.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            constraints: BTreeMap::new(),
            indexes: BTreeMap::new(),
        }
    }

    /// Add a column.
    pub fn with_column(mut self, column: Column) -> Self {
        self.columns.push(column);
        self
    }

    /// Add multiple columns.
    pub fn with_columns(mut self, columns: impl IntoIterator<Item = Column>) -> Self {
        self.columns.extend(columns);
        self
    }

    /// Add a constraint.
    pub fn with_constraint(mut self, constraint: Constraint) -> Self {
        self.constraints.insert(constraint.name.clone(), constraint);
        self
    }

    /// Add an index.
    pub fn with_index(mut self, index: Index) -> Self {
        self.indexes.insert(index.name.clone(), index);
        self
    }

    /// Get a column by name.
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Position of a column in declaration order.
    pub fn column_position(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Check whether a column exists.
    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    /// The primary key constraint, if any.
    pub fn primary_key(&self) -> Option<&Constraint> {
        self.constraints.values().find(|c| c.is_primary_key())
    }

    /// All foreign key constraints.
    pub fn foreign_keys(&self) -> impl Iterator<Item = &Constraint> {
        self.constraints.values().filter(|c| c.is_foreign_key())
    }

    /// Names of the other tables this table references through foreign keys.
    pub fn referenced_tables(&self) -> BTreeSet<&str> {
        self.foreign_keys()
            .filter_map(|fk| fk.referenced_table())
            .filter(|t| *t != self.name)
            .collect()
    }

    /// A copy of this table with all foreign keys removed.
    ///
    /// Tables are created and dropped without their foreign keys; those travel
    /// as separate constraint operations.
    pub fn without_foreign_keys(&self) -> Table {
        let mut table = self.clone();
        table.constraints.retain(|_, c| !c.is_foreign_key());
        table
    }
}
