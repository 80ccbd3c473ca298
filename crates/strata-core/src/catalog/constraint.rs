//! Constraint definitions for tables.

use serde::{Deserialize, Serialize};

/// Action taken on referencing rows when a referenced row changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferentialAction {
    /// Reject the change at the end of the statement.
    #[default]
    NoAction,
    /// Reject the change immediately.
    Restrict,
    /// Propagate the change to referencing rows.
    Cascade,
    /// Set referencing columns to NULL.
    SetNull,
    /// Set referencing columns to their defaults.
    SetDefault,
}

impl ReferentialAction {
    /// SQL keyword(s) for this action.
    pub fn as_sql(&self) -> &'static str {
        match self {
            ReferentialAction::NoAction => "NO ACTION",
            ReferentialAction::Restrict => "RESTRICT",
            ReferentialAction::Cascade => "CASCADE",
            ReferentialAction::SetNull => "SET NULL",
            ReferentialAction::SetDefault => "SET DEFAULT",
        }
    }
}

/// The kind of a constraint, with kind-specific data.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConstraintKind {
    /// Primary key.
    PrimaryKey,
    /// Uniqueness constraint (single or composite).
    Unique,
    /// Check constraint (expression must evaluate to true).
    Check {
        /// Boolean SQL expression.
        expression: String,
    },
    /// Foreign key constraint.
    ForeignKey {
        /// Referenced table.
        references_table: String,
        /// Referenced columns, positionally matched to the constraint columns.
        references_columns: Vec<String>,
        /// Action on delete of the referenced row.
        #[serde(default)]
        on_delete: ReferentialAction,
        /// Action on update of the referenced key.
        #[serde(default)]
        on_update: ReferentialAction,
    },
}

/// A named constraint on a table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Constraint {
    /// Constraint name (unique within its table).
    pub name: String,
    /// Participating columns. Empty for check constraints that do not name them.
    #[serde(default)]
    pub columns: Vec<String>,
    /// Constraint kind.
    pub kind: ConstraintKind,
}

impl Constraint {
    /// Create a primary key constraint.
    pub fn primary_key(
        name: impl Into<String>,
        columns: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            name: name.into(),
            columns: columns.into_iter().map(Into::into).collect(),
            kind: ConstraintKind::PrimaryKey,
        }
    }

    /// Create a unique constraint.
    pub fn unique(
        name: impl Into<String>,
        columns: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            name: name.into(),
            columns: columns.into_iter().map(Into::into).collect(),
            kind: ConstraintKind::Unique,
        }
    }

    /// Create a check constraint.
    pub fn check(name: impl Into<String>, expression: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            kind: ConstraintKind::Check {
                expression: expression.into(),
            },
        }
    }

    /// Create a single-column foreign key with `NO ACTION` policies.
    pub fn foreign_key(
        name: impl Into<String>,
        column: impl Into<String>,
        references_table: impl Into<String>,
        references_column: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            columns: vec![column.into()],
            kind: ConstraintKind::ForeignKey {
                references_table: references_table.into(),
                references_columns: vec![references_column.into()],
                on_delete: ReferentialAction::NoAction,
                on_update: ReferentialAction::NoAction,
            },
        }
    }

    /// Set the delete policy. No-op for non foreign keys.
    pub fn on_delete(mut self, action: ReferentialAction) -> Self {
        if let ConstraintKind::ForeignKey { on_delete, .. } = &mut self.kind {
            *on_delete = action;
        }
        self
    }

    /// Set the update policy. No-op for non foreign keys.
    pub fn on_update(mut self, action: ReferentialAction) -> Self {
        if let ConstraintKind::ForeignKey { on_update, .. } = &mut self.kind {
            *on_update = action;
        }
        self
    }

    /// Check if this is a primary key.
    pub fn is_primary_key(&self) -> bool {
        matches!(self.kind, ConstraintKind::PrimaryKey)
    }

    /// Check if this is a foreign key.
    pub fn is_foreign_key(&self) -> bool {
        matches!(self.kind, ConstraintKind::ForeignKey { .. })
    }

    /// The table referenced by this constraint, if it is a foreign key.
    pub fn referenced_table(&self) -> Option<&str> {
        match &self.kind {
            ConstraintKind::ForeignKey {
                references_table, ..
            } => Some(references_table),
            _ => None,
        }
    }

    /// Rewrite every mention of a column of `table` after a column rename.
    ///
    /// `owner` is the table this constraint lives on.
    pub(crate) fn rename_column(&mut self, owner: &str, table: &str, from: &str, to: &str) {
        if owner == table {
            for column in &mut self.columns {
                if column == from {
                    *column = to.to_string();
                }
            }
        }
        if let ConstraintKind::ForeignKey {
            references_table,
            references_columns,
            ..
        } = &mut self.kind
        {
            if references_table == table {
                for column in references_columns {
                    if column == from {
                        *column = to.to_string();
                    }
                }
            }
        }
    }

    /// Rewrite the referenced table after a table rename.
    pub(crate) fn rename_table(&mut self, from: &str, to: &str) {
        if let ConstraintKind::ForeignKey {
            references_table, ..
        } = &mut self.kind
        {
            if references_table == from {
                *references_table = to.to_string();
            }
        }
    }

    /// Short human-readable kind name.
    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            ConstraintKind::PrimaryKey => "primary key",
            ConstraintKind::Unique => "unique",
            ConstraintKind::Check { .. } => "check",
            ConstraintKind::ForeignKey { .. } => "foreign key",
        }
    }
}
