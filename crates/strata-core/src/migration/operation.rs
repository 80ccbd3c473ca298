//! Structural change operations.
//!
//! Every operation carries the full definitions it touches, so it can be
//! inverted without consulting the model it was computed from.

use super::error::MigrationError;
use crate::catalog::{Column, Constraint, ConstraintKind, Index, Model, Table};
use serde::{Deserialize, Serialize};

/// A single structural change to a [`Model`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    /// Create a table (never with foreign keys).
    CreateTable {
        /// Full table definition.
        table: Table,
    },
    /// Drop a table.
    DropTable {
        /// Definition of the table being dropped.
        table: Table,
    },
    /// Add a column at a position.
    AddColumn {
        /// Owning table.
        table: String,
        /// Column definition.
        column: Column,
        /// Position in the table's column list.
        position: usize,
    },
    /// Drop a column.
    DropColumn {
        /// Owning table.
        table: String,
        /// Definition of the column being dropped.
        column: Column,
        /// Position the column occupied.
        position: usize,
    },
    /// Change a column's type, nullability, default or identity flag.
    AlterColumn {
        /// Owning table.
        table: String,
        /// Definition before the change.
        from: Column,
        /// Definition after the change.
        to: Column,
    },
    /// Add a constraint.
    AddConstraint {
        /// Owning table.
        table: String,
        /// Constraint definition.
        constraint: Constraint,
    },
    /// Drop a constraint.
    DropConstraint {
        /// Owning table.
        table: String,
        /// Definition of the constraint being dropped.
        constraint: Constraint,
    },
    /// Create an index.
    CreateIndex {
        /// Owning table.
        table: String,
        /// Index definition.
        index: Index,
    },
    /// Drop an index.
    DropIndex {
        /// Owning table.
        table: String,
        /// Definition of the index being dropped.
        index: Index,
    },
    /// Rename a table.
    RenameTable {
        /// Current name.
        from: String,
        /// New name.
        to: String,
    },
    /// Rename a column.
    RenameColumn {
        /// Owning table.
        table: String,
        /// Current name.
        from: String,
        /// New name.
        to: String,
    },
    /// Raw SQL escape hatch for changes outside the vocabulary.
    ///
    /// Has no effect on the model.
    Sql {
        /// Forward statement.
        sql: String,
        /// Statement that undoes `sql`, if one exists.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reverse: Option<String>,
    },
}

impl Operation {
    /// The table this operation affects, if it affects exactly one.
    pub fn table_name(&self) -> Option<&str> {
        match self {
            Operation::CreateTable { table } | Operation::DropTable { table } => Some(&table.name),
            Operation::AddColumn { table, .. }
            | Operation::DropColumn { table, .. }
            | Operation::AlterColumn { table, .. }
            | Operation::AddConstraint { table, .. }
            | Operation::DropConstraint { table, .. }
            | Operation::CreateIndex { table, .. }
            | Operation::DropIndex { table, .. }
            | Operation::RenameColumn { table, .. } => Some(table),
            Operation::RenameTable { from, .. } => Some(from),
            Operation::Sql { .. } => None,
        }
    }

    /// The structural inverse of this operation.
    ///
    /// `None` only for raw SQL without a reverse statement.
    pub fn inverse(&self) -> Option<Operation> {
        let inverse = match self {
            Operation::CreateTable { table } => Operation::DropTable {
                table: table.clone(),
            },
            Operation::DropTable { table } => Operation::CreateTable {
                table: table.clone(),
            },
            Operation::AddColumn {
                table,
                column,
                position,
            } => Operation::DropColumn {
                table: table.clone(),
                column: column.clone(),
                position: *position,
            },
            Operation::DropColumn {
                table,
                column,
                position,
            } => Operation::AddColumn {
                table: table.clone(),
                column: column.clone(),
                position: *position,
            },
            Operation::AlterColumn { table, from, to } => Operation::AlterColumn {
                table: table.clone(),
                from: to.clone(),
                to: from.clone(),
            },
            Operation::AddConstraint { table, constraint } => Operation::DropConstraint {
                table: table.clone(),
                constraint: constraint.clone(),
            },
            Operation::DropConstraint { table, constraint } => Operation::AddConstraint {
                table: table.clone(),
                constraint: constraint.clone(),
            },
            Operation::CreateIndex { table, index } => Operation::DropIndex {
                table: table.clone(),
                index: index.clone(),
            },
            Operation::DropIndex { table, index } => Operation::CreateIndex {
                table: table.clone(),
                index: index.clone(),
            },
            Operation::RenameTable { from, to } => Operation::RenameTable {
                from: to.clone(),
                to: from.clone(),
            },
            Operation::RenameColumn { table, from, to } => Operation::RenameColumn {
                table: table.clone(),
                from: to.clone(),
                to: from.clone(),
            },
            Operation::Sql { sql, reverse } => Operation::Sql {
                sql: reverse.clone()?,
                reverse: Some(sql.clone()),
            },
        };
        Some(inverse)
    }

    /// Why running this operation's inverse cannot restore the data it
    /// destroys. `None` when the operation is losslessly reversible.
    pub fn data_loss(&self) -> Option<&'static str> {
        match self {
            Operation::DropTable { .. } => Some("table rows cannot be reconstructed"),
            Operation::DropColumn { .. } => Some("column data cannot be reconstructed"),
            Operation::Sql { reverse: None, .. } => Some("raw SQL has no reverse statement"),
            _ => None,
        }
    }

    /// Apply this operation to a model, checking its preconditions.
    pub fn apply(&self, model: &mut Model) -> Result<(), MigrationError> {
        match self {
            Operation::CreateTable { table } => {
                if model.tables.contains_key(&table.name) {
                    return Err(self.precondition("table already exists"));
                }
                for index in table.indexes.keys() {
                    if index_exists(model, index) {
                        return Err(self.precondition(format!("index '{}' already exists", index)));
                    }
                }
                model.tables.insert(table.name.clone(), table.clone());
            }
            Operation::DropTable { table } => {
                let existing = self.existing_table(model, &table.name)?;
                if existing != table {
                    return Err(self.precondition("table definition does not match the model"));
                }
                if let Some((owner, fk)) = model
                    .references_to(&table.name)
                    .into_iter()
                    .find(|(owner, _)| *owner != table.name)
                {
                    return Err(self.precondition(format!(
                        "still referenced by foreign key '{}' on '{}'",
                        fk.name, owner
                    )));
                }
                model.tables.remove(&table.name);
            }
            Operation::AddColumn {
                table,
                column,
                position,
            } => {
                let target = self.existing_table_mut(model, table)?;
                if target.has_column(&column.name) {
                    return Err(self.precondition("column already exists"));
                }
                if *position > target.columns.len() {
                    return Err(self.precondition(format!(
                        "position {} is past the end of {} columns",
                        position,
                        target.columns.len()
                    )));
                }
                target.columns.insert(*position, column.clone());
            }
            Operation::DropColumn {
                table,
                column,
                position,
            } => {
                let referenced_elsewhere = model.references_to(table).into_iter().any(|(_, fk)| {
                    matches!(&fk.kind, ConstraintKind::ForeignKey { references_columns, .. }
                        if references_columns.contains(&column.name))
                });
                if referenced_elsewhere {
                    return Err(self.precondition("column is referenced by a foreign key"));
                }
                let target = self.existing_table_mut(model, table)?;
                if target.columns.get(*position) != Some(column) {
                    return Err(self.precondition(format!(
                        "column definition at position {} does not match the model",
                        position
                    )));
                }
                if let Some(c) = target
                    .constraints
                    .values()
                    .find(|c| c.columns.contains(&column.name))
                {
                    return Err(self.precondition(format!("column is used by constraint '{}'", c.name)));
                }
                if let Some(i) = target
                    .indexes
                    .values()
                    .find(|i| i.columns.contains(&column.name))
                {
                    return Err(self.precondition(format!("column is used by index '{}'", i.name)));
                }
                target.columns.remove(*position);
            }
            Operation::AlterColumn { table, from, to } => {
                if from.name != to.name {
                    return Err(self.precondition("alter-column cannot rename; use rename-column"));
                }
                let target = self.existing_table_mut(model, table)?;
                let slot = target
                    .columns
                    .iter_mut()
                    .find(|c| c.name == from.name)
                    .ok_or_else(|| self.precondition("column does not exist"))?;
                if slot != from {
                    return Err(self.precondition("column definition does not match the model"));
                }
                *slot = to.clone();
            }
            Operation::AddConstraint { table, constraint } => {
                if let ConstraintKind::ForeignKey {
                    references_table,
                    references_columns,
                    ..
                } = &constraint.kind
                {
                    let referenced = model.table(references_table).ok_or_else(|| {
                        self.precondition(format!("referenced table '{}' does not exist", references_table))
                    })?;
                    if let Some(missing) = references_columns.iter().find(|c| !referenced.has_column(c)) {
                        return Err(self.precondition(format!(
                            "referenced column '{}.{}' does not exist",
                            references_table, missing
                        )));
                    }
                }
                let target = self.existing_table_mut(model, table)?;
                if target.constraints.contains_key(&constraint.name) {
                    return Err(self.precondition("constraint already exists"));
                }
                if let Some(missing) = constraint.columns.iter().find(|c| !target.has_column(c)) {
                    return Err(self.precondition(format!("column '{}' does not exist", missing)));
                }
                if constraint.is_primary_key() && target.primary_key().is_some() {
                    return Err(self.precondition("table already has a primary key"));
                }
                target
                    .constraints
                    .insert(constraint.name.clone(), constraint.clone());
            }
            Operation::DropConstraint { table, constraint } => {
                let target = self.existing_table_mut(model, table)?;
                match target.constraints.get(&constraint.name) {
                    Some(existing) if existing != constraint => {
                        return Err(self.precondition("constraint definition does not match the model"))
                    }
                    Some(_) => {}
                    None => return Err(self.precondition("constraint does not exist")),
                }
                target.constraints.remove(&constraint.name);
            }
            Operation::CreateIndex { table, index } => {
                if index_exists(model, &index.name) {
                    return Err(self.precondition("index already exists"));
                }
                let target = self.existing_table_mut(model, table)?;
                if let Some(missing) = index.columns.iter().find(|c| !target.has_column(c)) {
                    return Err(self.precondition(format!("column '{}' does not exist", missing)));
                }
                target.indexes.insert(index.name.clone(), index.clone());
            }
            Operation::DropIndex { table, index } => {
                let target = self.existing_table_mut(model, table)?;
                match target.indexes.get(&index.name) {
                    Some(existing) if existing != index => {
                        return Err(self.precondition("index definition does not match the model"))
                    }
                    Some(_) => {}
                    None => return Err(self.precondition("index does not exist")),
                }
                target.indexes.remove(&index.name);
            }
            Operation::RenameTable { from, to } => {
                if model.tables.contains_key(to) {
                    return Err(self.precondition(format!("table '{}' already exists", to)));
                }
                let mut table = model
                    .tables
                    .remove(from)
                    .ok_or_else(|| self.precondition("table does not exist"))?;
                table.name = to.clone();
                model.tables.insert(to.clone(), table);
                for t in model.tables.values_mut() {
                    for constraint in t.constraints.values_mut() {
                        constraint.rename_table(from, to);
                    }
                }
            }
            Operation::RenameColumn { table, from, to } => {
                let target = self.existing_table_mut(model, table)?;
                if target.has_column(to) {
                    return Err(self.precondition(format!("column '{}' already exists", to)));
                }
                let column = target
                    .columns
                    .iter_mut()
                    .find(|c| &c.name == from)
                    .ok_or_else(|| self.precondition("column does not exist"))?;
                column.name = to.clone();
                for index in target.indexes.values_mut() {
                    index.rename_column(from, to);
                }
                for t in model.tables.values_mut() {
                    let owner = t.name.clone();
                    for constraint in t.constraints.values_mut() {
                        constraint.rename_column(&owner, table, from, to);
                    }
                }
            }
            Operation::Sql { .. } => {}
        }
        Ok(())
    }

    fn existing_table<'m>(&self, model: &'m Model, name: &str) -> Result<&'m Table, MigrationError> {
        model
            .table(name)
            .ok_or_else(|| self.precondition(format!("table '{}' does not exist", name)))
    }

    fn existing_table_mut<'m>(
        &self,
        model: &'m mut Model,
        name: &str,
    ) -> Result<&'m mut Table, MigrationError> {
        model
            .table_mut(name)
            .ok_or_else(|| self.precondition(format!("table '{}' does not exist", name)))
    }

    fn precondition(&self, message: impl Into<String>) -> MigrationError {
        MigrationError::InvalidOperation {
            operation: self.to_string(),
            message: message.into(),
        }
    }
}

fn index_exists(model: &Model, name: &str) -> bool {
    model.tables.values().any(|t| t.indexes.contains_key(name))
}

/// Apply a sequence of operations to a model, stopping at the first failure.
pub fn apply_all<'a>(
    model: &mut Model,
    operations: impl IntoIterator<Item = &'a Operation>,
) -> Result<(), MigrationError> {
    for operation in operations {
        operation.apply(model)?;
    }
    Ok(())
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operation::CreateTable { table } => write!(f, "create table {}", table.name),
            Operation::DropTable { table } => write!(f, "drop table {}", table.name),
            Operation::AddColumn { table, column, .. } => {
                write!(f, "add column {}.{}", table, column.name)
            }
            Operation::DropColumn { table, column, .. } => {
                write!(f, "drop column {}.{}", table, column.name)
            }
            Operation::AlterColumn { table, to, .. } => {
                write!(f, "alter column {}.{}", table, to.name)
            }
            Operation::AddConstraint { table, constraint } => {
                write!(f, "add constraint {} on {}", constraint.name, table)
            }
            Operation::DropConstraint { table, constraint } => {
                write!(f, "drop constraint {} on {}", constraint.name, table)
            }
            Operation::CreateIndex { table, index } => {
                write!(f, "create index {} on {}", index.name, table)
            }
            Operation::DropIndex { table, index } => {
                write!(f, "drop index {} on {}", index.name, table)
            }
            Operation::RenameTable { from, to } => write!(f, "rename table {} to {}", from, to),
            Operation::RenameColumn { table, from, to } => {
                write!(f, "rename column {}.{} to {}", table, from, to)
            }
            Operation::Sql { sql, .. } => {
                let first_line = sql.lines().next().unwrap_or_default();
                write!(f, "sql {}", first_line)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ColumnType;

    fn author() -> Table {
        Table::new("Author")
            .with_column(Column::new("AuthorId", ColumnType::Integer).identity())
            .with_column(Column::new("Name", ColumnType::Text))
            .with_constraint(Constraint::primary_key("pk_Author", ["AuthorId"]))
    }

    fn book() -> Table {
        Table::new("Book")
            .with_column(Column::new("BookId", ColumnType::Integer))
            .with_column(Column::new("AuthorId", ColumnType::Integer))
            .with_constraint(Constraint::primary_key("pk_Book", ["BookId"]))
    }

    fn fk() -> Constraint {
        Constraint::foreign_key("fk_Book_Author", "AuthorId", "Author", "AuthorId")
    }

    fn assert_roundtrip(model: &Model, op: &Operation) {
        let before = model.content_hash();
        let mut working = model.clone();
        op.apply(&mut working).unwrap();
        op.inverse().unwrap().apply(&mut working).unwrap();
        assert_eq!(working.content_hash(), before, "roundtrip of {}", op);
    }

    #[test]
    fn test_create_and_drop_table() {
        let mut model = Model::new();
        Operation::CreateTable { table: author() }.apply(&mut model).unwrap();
        assert!(model.table("Author").is_some());

        let err = Operation::CreateTable { table: author() }
            .apply(&mut model)
            .unwrap_err();
        assert!(err.to_string().contains("already exists"));

        Operation::DropTable { table: author() }.apply(&mut model).unwrap();
        assert!(model.is_empty());
    }

    #[test]
    fn test_drop_table_refuses_when_referenced() {
        let mut model = Model::new()
            .with_table(author())
            .with_table(book().with_constraint(fk()));

        let err = Operation::DropTable { table: author() }
            .apply(&mut model)
            .unwrap_err();
        assert!(err.to_string().contains("fk_Book_Author"));
    }

    #[test]
    fn test_add_column_at_position() {
        let mut model = Model::new().with_table(author());
        Operation::AddColumn {
            table: "Author".into(),
            column: Column::nullable("Bio", ColumnType::Text),
            position: 1,
        }
        .apply(&mut model)
        .unwrap();

        let names: Vec<_> = model.table("Author").unwrap().columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["AuthorId", "Bio", "Name"]);
    }

    #[test]
    fn test_drop_column_checks_dependents() {
        let mut model = Model::new().with_table(author());
        let err = Operation::DropColumn {
            table: "Author".into(),
            column: Column::new("AuthorId", ColumnType::Integer).identity(),
            position: 0,
        }
        .apply(&mut model)
        .unwrap_err();
        assert!(err.to_string().contains("pk_Author"));
    }

    #[test]
    fn test_alter_column_requires_matching_definition() {
        let mut model = Model::new().with_table(author());
        let err = Operation::AlterColumn {
            table: "Author".into(),
            from: Column::nullable("Name", ColumnType::Text),
            to: Column::new("Name", ColumnType::Varchar { length: 100 }),
        }
        .apply(&mut model)
        .unwrap_err();
        assert!(matches!(err, MigrationError::InvalidOperation { .. }));
    }

    #[test]
    fn test_add_foreign_key_requires_target() {
        let mut model = Model::new().with_table(book());
        let err = Operation::AddConstraint {
            table: "Book".into(),
            constraint: fk(),
        }
        .apply(&mut model)
        .unwrap_err();
        assert!(err.to_string().contains("referenced table 'Author'"));
    }

    #[test]
    fn test_rename_table_rewrites_references() {
        let mut model = Model::new()
            .with_table(author())
            .with_table(book().with_constraint(fk()));

        Operation::RenameTable {
            from: "Author".into(),
            to: "Writer".into(),
        }
        .apply(&mut model)
        .unwrap();

        assert!(model.table("Author").is_none());
        assert_eq!(model.table("Writer").unwrap().name, "Writer");
        let fk = &model.table("Book").unwrap().constraints["fk_Book_Author"];
        assert_eq!(fk.referenced_table(), Some("Writer"));
    }

    #[test]
    fn test_rename_column_rewrites_constraints_and_indexes() {
        let mut model = Model::new()
            .with_table(author().with_index(Index::new("ix_Author_Name", ["Name"])))
            .with_table(book().with_constraint(fk()));

        Operation::RenameColumn {
            table: "Author".into(),
            from: "AuthorId".into(),
            to: "Id".into(),
        }
        .apply(&mut model)
        .unwrap();

        let author = model.table("Author").unwrap();
        assert!(author.has_column("Id"));
        assert_eq!(author.constraints["pk_Author"].columns, vec!["Id".to_string()]);
        match &model.table("Book").unwrap().constraints["fk_Book_Author"].kind {
            ConstraintKind::ForeignKey {
                references_columns, ..
            } => assert_eq!(references_columns, &vec!["Id".to_string()]),
            _ => panic!("Expected ForeignKey"),
        }
    }

    #[test]
    fn test_every_operation_roundtrips() {
        let model = Model::new()
            .with_table(author().with_index(Index::new("ix_Author_Name", ["Name"])))
            .with_table(book());

        let ops = vec![
            Operation::CreateTable {
                table: Table::new("Tag").with_column(Column::new("Label", ColumnType::Text)),
            },
            Operation::DropTable { table: book() },
            Operation::AddColumn {
                table: "Author".into(),
                column: Column::nullable("Bio", ColumnType::Text),
                position: 2,
            },
            Operation::AlterColumn {
                table: "Author".into(),
                from: Column::new("Name", ColumnType::Text),
                to: Column::nullable("Name", ColumnType::Varchar { length: 80 }),
            },
            Operation::AddConstraint {
                table: "Book".into(),
                constraint: fk(),
            },
            Operation::AddConstraint {
                table: "Author".into(),
                constraint: Constraint::check("ck_Author_Name", "length(\"Name\") > 0"),
            },
            Operation::DropIndex {
                table: "Author".into(),
                index: Index::new("ix_Author_Name", ["Name"]),
            },
            Operation::CreateIndex {
                table: "Book".into(),
                index: Index::unique("ux_Book_AuthorId", ["AuthorId"]),
            },
            Operation::RenameTable {
                from: "Book".into(),
                to: "Volume".into(),
            },
            Operation::RenameColumn {
                table: "Book".into(),
                from: "AuthorId".into(),
                to: "WriterId".into(),
            },
            Operation::Sql {
                sql: "UPDATE \"Author\" SET \"Name\" = upper(\"Name\")".into(),
                reverse: Some("SELECT 1".into()),
            },
        ];

        for op in &ops {
            assert_roundtrip(&model, op);
        }
    }

    #[test]
    fn test_inverse_of_inverse_is_identity() {
        let op = Operation::AlterColumn {
            table: "Author".into(),
            from: Column::new("Name", ColumnType::Text),
            to: Column::nullable("Name", ColumnType::Text),
        };
        assert_eq!(op.inverse().unwrap().inverse().unwrap(), op);
    }

    #[test]
    fn test_data_loss_classification() {
        assert!(Operation::DropTable { table: author() }.data_loss().is_some());
        assert!(Operation::CreateTable { table: author() }.data_loss().is_none());
        assert!(Operation::Sql {
            sql: "DELETE FROM x".into(),
            reverse: None
        }
        .data_loss()
        .is_some());
        assert!(Operation::Sql {
            sql: "DELETE FROM x".into(),
            reverse: None
        }
        .inverse()
        .is_none());
    }

    #[test]
    fn test_json_encoding_is_tagged() {
        let op = Operation::RenameTable {
            from: "a".into(),
            to: "b".into(),
        };
        let json = serde_json::to_string(&op).unwrap();
        assert_eq!(json, r#"{"op":"rename_table","from":"a","to":"b"}"#);

        let sql: Operation = serde_json::from_str(r#"{"op":"sql","sql":"VACUUM"}"#).unwrap();
        assert_eq!(
            sql,
            Operation::Sql {
                sql: "VACUUM".into(),
                reverse: None
            }
        );
    }

    #[test]
    fn test_display() {
        let op = Operation::AddConstraint {
            table: "Book".into(),
            constraint: fk(),
        };
        assert_eq!(op.to_string(), "add constraint fk_Book_Author on Book");
    }
}
