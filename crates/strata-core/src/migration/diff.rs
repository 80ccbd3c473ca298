//! Schema diffing algorithm.
//!
//! Compares two [`Model`]s and produces an ordered [`Delta`] of operations
//! that transforms the first into the second.
//!
//! Operations are emitted in dependency order:
//!
//! 1. explicit renames (tables, then columns)
//! 2. drops: foreign keys, other constraints, indexes, columns, tables
//! 3. table creations (referenced tables first)
//! 4. column additions, then column alterations
//! 5. constraint additions (foreign keys last), then index creations
//!
//! Every operation is applied to a working copy of the old model as it is
//! emitted, so positions are always relative to the model the operation will
//! actually see, and the final working copy must equal the new model.

use super::error::MigrationError;
use super::operation::Operation;
use crate::catalog::{Model, Table};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};

/// A table rename annotation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableRename {
    /// Name in the old model.
    pub from: String,
    /// Name in the new model.
    pub to: String,
}

/// A column rename annotation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnRename {
    /// Table name as it appears in the new model.
    pub table: String,
    /// Column name in the old model.
    pub from: String,
    /// Column name in the new model.
    pub to: String,
}

/// Caller-supplied rename annotations.
///
/// Renames are never inferred; without a hint a renamed object is a drop
/// plus an add.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenameHints {
    /// Table renames.
    #[serde(default)]
    pub tables: Vec<TableRename>,
    /// Column renames.
    #[serde(default)]
    pub columns: Vec<ColumnRename>,
}

impl RenameHints {
    /// Create an empty set of hints.
    pub fn new() -> Self {
        Self::default()
    }

    /// Annotate a table rename.
    pub fn rename_table(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.tables.push(TableRename {
            from: from.into(),
            to: to.into(),
        });
        self
    }

    /// Annotate a column rename. `table` is the table's name in the new model.
    pub fn rename_column(
        mut self,
        table: impl Into<String>,
        from: impl Into<String>,
        to: impl Into<String>,
    ) -> Self {
        self.columns.push(ColumnRename {
            table: table.into(),
            from: from.into(),
            to: to.into(),
        });
        self
    }

    /// Check if there are no hints.
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty() && self.columns.is_empty()
    }
}

/// Ordered structural difference between two models.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delta {
    /// Content hash of the source model.
    pub from_hash: String,
    /// Content hash of the target model.
    pub to_hash: String,
    /// Operations, in application order.
    pub operations: Vec<Operation>,
}

impl Delta {
    /// Compute the delta between two models.
    pub fn compute(from: &Model, to: &Model) -> Result<Self, MigrationError> {
        Self::compute_with_renames(from, to, &RenameHints::default())
    }

    /// Compute the delta between two models, honouring rename annotations.
    pub fn compute_with_renames(
        from: &Model,
        to: &Model,
        hints: &RenameHints,
    ) -> Result<Self, MigrationError> {
        from.validate()?;
        to.validate()?;

        let mut differ = Differ {
            current: from.clone(),
            target: to,
            operations: Vec::new(),
        };
        differ.renames(hints)?;
        differ.check_column_order()?;
        differ.drops()?;
        differ.creates()?;
        differ.columns()?;
        differ.additions()?;

        if differ.current != *to {
            return Err(MigrationError::UnsupportedChange {
                message: "computed operations do not reproduce the target model".to_string(),
            });
        }

        Ok(Delta {
            from_hash: from.content_hash(),
            to_hash: to.content_hash(),
            operations: differ.operations,
        })
    }

    /// Check if there are any changes.
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Get the number of operations.
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    /// Apply the delta's operations to a model.
    pub fn apply_to(&self, model: &mut Model) -> Result<(), MigrationError> {
        super::operation::apply_all(model, &self.operations)
    }
}

struct Differ<'a> {
    current: Model,
    target: &'a Model,
    operations: Vec<Operation>,
}

impl Differ<'_> {
    fn emit(&mut self, operation: Operation) -> Result<(), MigrationError> {
        operation.apply(&mut self.current)?;
        self.operations.push(operation);
        Ok(())
    }

    fn renames(&mut self, hints: &RenameHints) -> Result<(), MigrationError> {
        for rename in &hints.tables {
            if self.current.table(&rename.from).is_none() {
                return Err(bad_hint(format!(
                    "rename source table '{}' does not exist",
                    rename.from
                )));
            }
            if self.target.table(&rename.to).is_none() {
                return Err(bad_hint(format!(
                    "rename target table '{}' is not in the new model",
                    rename.to
                )));
            }
            self.emit(Operation::RenameTable {
                from: rename.from.clone(),
                to: rename.to.clone(),
            })?;
        }

        for rename in &hints.columns {
            let exists_in_target = self
                .target
                .table(&rename.table)
                .is_some_and(|t| t.has_column(&rename.to));
            if !exists_in_target {
                return Err(bad_hint(format!(
                    "rename target column '{}.{}' is not in the new model",
                    rename.table, rename.to
                )));
            }
            let exists_now = self
                .current
                .table(&rename.table)
                .is_some_and(|t| t.has_column(&rename.from));
            if !exists_now {
                return Err(bad_hint(format!(
                    "rename source column '{}.{}' does not exist",
                    rename.table, rename.from
                )));
            }
            self.emit(Operation::RenameColumn {
                table: rename.table.clone(),
                from: rename.from.clone(),
                to: rename.to.clone(),
            })?;
        }
        Ok(())
    }

    /// Surviving columns must keep their relative order; the operation
    /// vocabulary cannot move a column.
    fn check_column_order(&self) -> Result<(), MigrationError> {
        for (name, old) in &self.current.tables {
            let Some(new) = self.target.table(name) else {
                continue;
            };
            let old_order: Vec<&str> = old
                .columns
                .iter()
                .map(|c| c.name.as_str())
                .filter(|c| new.has_column(c))
                .collect();
            let new_order: Vec<&str> = new
                .columns
                .iter()
                .map(|c| c.name.as_str())
                .filter(|c| old.has_column(c))
                .collect();
            if old_order != new_order {
                return Err(MigrationError::UnsupportedChange {
                    message: format!("columns of '{}' were reordered", name),
                });
            }
        }
        Ok(())
    }

    fn drops(&mut self) -> Result<(), MigrationError> {
        let dropped: BTreeSet<String> = self
            .current
            .tables
            .keys()
            .filter(|name| self.target.table(name).is_none())
            .cloned()
            .collect();

        // Foreign keys first: anything on a dropped table, anything pointing
        // at one, and anything that changed.
        let mut fk_drops = Vec::new();
        for table in self.current.tables.values() {
            for fk in table.foreign_keys() {
                let survives = self
                    .target
                    .table(&table.name)
                    .and_then(|t| t.constraints.get(&fk.name))
                    == Some(fk);
                if !survives {
                    fk_drops.push(Operation::DropConstraint {
                        table: table.name.clone(),
                        constraint: fk.clone(),
                    });
                }
            }
        }
        for op in fk_drops {
            self.emit(op)?;
        }

        // Remaining constraints and indexes on tables that survive.
        let mut object_drops = Vec::new();
        for table in self.current.tables.values() {
            let Some(new) = self.target.table(&table.name) else {
                continue;
            };
            for constraint in table.constraints.values() {
                if new.constraints.get(&constraint.name) != Some(constraint) {
                    object_drops.push(Operation::DropConstraint {
                        table: table.name.clone(),
                        constraint: constraint.clone(),
                    });
                }
            }
            for index in table.indexes.values() {
                if new.indexes.get(&index.name) != Some(index) {
                    object_drops.push(Operation::DropIndex {
                        table: table.name.clone(),
                        index: index.clone(),
                    });
                }
            }
        }
        for op in object_drops {
            self.emit(op)?;
        }

        // Columns on tables that survive.
        let mut column_drops = Vec::new();
        for table in self.current.tables.values() {
            let Some(new) = self.target.table(&table.name) else {
                continue;
            };
            for column in table.columns.iter().rev() {
                if !new.has_column(&column.name) {
                    column_drops.push((table.name.clone(), column.name.clone()));
                }
            }
        }
        for (table, column) in column_drops {
            let current = &self.current.tables[&table];
            let position = current.column_position(&column).ok_or_else(|| {
                MigrationError::UnsupportedChange {
                    message: format!("column '{}.{}' vanished during diff", table, column),
                }
            })?;
            let op = Operation::DropColumn {
                column: current.columns[position].clone(),
                table,
                position,
            };
            self.emit(op)?;
        }

        // Tables, dependents before the tables they reference.
        let tables: Vec<&Table> = dropped.iter().map(|n| &self.current.tables[n]).collect();
        let mut order = dependency_order(&tables);
        order.reverse();
        for name in order {
            let table = self.current.tables[&name].clone();
            self.emit(Operation::DropTable { table })?;
        }
        Ok(())
    }

    fn creates(&mut self) -> Result<(), MigrationError> {
        let created: Vec<&Table> = self
            .target
            .tables
            .values()
            .filter(|t| self.current.table(&t.name).is_none())
            .collect();
        for name in dependency_order(&created) {
            let table = self.target.tables[&name].without_foreign_keys();
            self.emit(Operation::CreateTable { table })?;
        }
        Ok(())
    }

    fn columns(&mut self) -> Result<(), MigrationError> {
        let target = self.target;

        for new in target.tables.values() {
            for (position, column) in new.columns.iter().enumerate() {
                if !self.current.tables[&new.name].has_column(&column.name) {
                    self.emit(Operation::AddColumn {
                        table: new.name.clone(),
                        column: column.clone(),
                        position,
                    })?;
                }
            }
        }

        for new in target.tables.values() {
            for column in &new.columns {
                let existing = self.current.tables[&new.name].column(&column.name);
                if let Some(existing) = existing.filter(|c| *c != column) {
                    let op = Operation::AlterColumn {
                        table: new.name.clone(),
                        from: existing.clone(),
                        to: column.clone(),
                    };
                    self.emit(op)?;
                }
            }
        }
        Ok(())
    }

    fn additions(&mut self) -> Result<(), MigrationError> {
        let target = self.target;
        let mut foreign_keys = Vec::new();

        for new in target.tables.values() {
            for constraint in new.constraints.values() {
                if self.current.tables[&new.name].constraints.get(&constraint.name) == Some(constraint) {
                    continue;
                }
                let op = Operation::AddConstraint {
                    table: new.name.clone(),
                    constraint: constraint.clone(),
                };
                if constraint.is_foreign_key() {
                    foreign_keys.push(op);
                } else {
                    self.emit(op)?;
                }
            }
        }
        for op in foreign_keys {
            self.emit(op)?;
        }

        for new in target.tables.values() {
            for index in new.indexes.values() {
                if self.current.tables[&new.name].indexes.get(&index.name) != Some(index) {
                    self.emit(Operation::CreateIndex {
                        table: new.name.clone(),
                        index: index.clone(),
                    })?;
                }
            }
        }
        Ok(())
    }
}

/// Order tables so that every table comes after the tables it references.
///
/// Ties break by name. Tables on a reference cycle keep name order after the
/// acyclic part.
pub(crate) fn dependency_order(tables: &[&Table]) -> Vec<String> {
    let names: HashSet<&str> = tables.iter().map(|t| t.name.as_str()).collect();
    let mut remaining: BTreeMap<&str, BTreeSet<&str>> = tables
        .iter()
        .map(|t| {
            let deps = t
                .referenced_tables()
                .into_iter()
                .filter(|d| names.contains(d))
                .collect();
            (t.name.as_str(), deps)
        })
        .collect();

    let mut order = Vec::with_capacity(tables.len());
    loop {
        let ready: Vec<&str> = remaining
            .iter()
            .filter(|(_, deps)| deps.is_empty())
            .map(|(name, _)| *name)
            .collect();
        if ready.is_empty() {
            break;
        }
        for name in ready {
            remaining.remove(name);
            for deps in remaining.values_mut() {
                deps.remove(name);
            }
            order.push(name.to_string());
        }
    }
    order.extend(remaining.keys().map(|n| n.to_string()));
    order
}

fn bad_hint(message: String) -> MigrationError {
    MigrationError::UnsupportedChange { message }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Column, ColumnType, Constraint, Index};

    fn author() -> Table {
        Table::new("Author")
            .with_column(Column::new("AuthorId", ColumnType::Integer).identity())
            .with_column(Column::new("Name", ColumnType::Text))
            .with_constraint(Constraint::primary_key("pk_Author", ["AuthorId"]))
    }

    fn book() -> Table {
        Table::new("Book")
            .with_column(Column::new("BookId", ColumnType::Integer).identity())
            .with_column(Column::new("Title", ColumnType::Text))
            .with_column(Column::new("AuthorId", ColumnType::Integer))
            .with_constraint(Constraint::primary_key("pk_Book", ["BookId"]))
            .with_constraint(Constraint::foreign_key(
                "fk_Book_Author",
                "AuthorId",
                "Author",
                "AuthorId",
            ))
    }

    fn assert_roundtrip(from: &Model, to: &Model) -> Delta {
        let delta = Delta::compute(from, to).unwrap();
        let mut model = from.clone();
        delta.apply_to(&mut model).unwrap();
        assert_eq!(&model, to);
        delta
    }

    #[test]
    fn test_diff_no_changes() {
        let model = Model::new().with_table(author()).with_table(book());
        let delta = Delta::compute(&model, &model).unwrap();

        assert!(delta.is_empty());
        assert_eq!(delta.from_hash, delta.to_hash);
    }

    #[test]
    fn test_diff_add_table_with_foreign_key() {
        let from = Model::new().with_table(author());
        let to = Model::new().with_table(author()).with_table(book());

        let delta = assert_roundtrip(&from, &to);
        let described: Vec<String> = delta.operations.iter().map(|o| o.to_string()).collect();

        assert_eq!(
            described,
            vec![
                "create table Book".to_string(),
                "add constraint fk_Book_Author on Book".to_string(),
            ]
        );
        match &delta.operations[0] {
            Operation::CreateTable { table } => {
                assert_eq!(table.foreign_keys().count(), 0);
                assert!(table.primary_key().is_some());
            }
            other => panic!("Expected CreateTable, got {}", other),
        }
    }

    #[test]
    fn test_diff_drop_table_drops_foreign_key_first() {
        let from = Model::new().with_table(author()).with_table(book());
        let to = Model::new().with_table(author());

        let delta = assert_roundtrip(&from, &to);
        assert!(matches!(delta.operations[0], Operation::DropConstraint { .. }));
        assert!(matches!(delta.operations[1], Operation::DropTable { .. }));
    }

    #[test]
    fn test_diff_drop_both_tables_in_reverse_dependency_order() {
        let from = Model::new().with_table(author()).with_table(book());
        let delta = assert_roundtrip(&from, &Model::new());

        let dropped: Vec<&str> = delta
            .operations
            .iter()
            .filter_map(|o| match o {
                Operation::DropTable { table } => Some(table.name.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(dropped, vec!["Book", "Author"]);
    }

    #[test]
    fn test_diff_create_tables_in_dependency_order() {
        let review = Table::new("Aardvark")
            .with_column(Column::new("BookId", ColumnType::Integer))
            .with_constraint(Constraint::foreign_key("fk_Aardvark_Book", "BookId", "Book", "BookId"));
        let to = Model::new()
            .with_table(author())
            .with_table(book())
            .with_table(review);

        let delta = assert_roundtrip(&Model::new(), &to);
        let created: Vec<&str> = delta
            .operations
            .iter()
            .filter_map(|o| match o {
                Operation::CreateTable { table } => Some(table.name.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(created, vec!["Author", "Book", "Aardvark"]);

        let first_fk = delta
            .operations
            .iter()
            .position(|o| matches!(o, Operation::AddConstraint { constraint, .. } if constraint.is_foreign_key()))
            .unwrap();
        let last_create = delta
            .operations
            .iter()
            .rposition(|o| matches!(o, Operation::CreateTable { .. }))
            .unwrap();
        assert!(first_fk > last_create);
    }

    #[test]
    fn test_diff_add_and_drop_columns() {
        let from = Model::new().with_table(author());
        let to = Model::new().with_table(
            Table::new("Author")
                .with_column(Column::new("AuthorId", ColumnType::Integer).identity())
                .with_column(Column::nullable("Email", ColumnType::Text))
                .with_constraint(Constraint::primary_key("pk_Author", ["AuthorId"])),
        );

        let delta = assert_roundtrip(&from, &to);
        assert_eq!(delta.len(), 2);
        assert!(matches!(delta.operations[0], Operation::DropColumn { .. }));
        assert!(
            matches!(&delta.operations[1], Operation::AddColumn { column, position, .. } if column.name == "Email" && *position == 1)
        );
    }

    #[test]
    fn test_diff_alter_column_captures_both_definitions() {
        let from = Model::new().with_table(author());
        let mut changed = author();
        changed.columns[1] = Column::nullable("Name", ColumnType::Varchar { length: 120 });
        let to = Model::new().with_table(changed);

        let delta = assert_roundtrip(&from, &to);
        match &delta.operations[..] {
            [Operation::AlterColumn { from, to, .. }] => {
                assert_eq!(from.column_type, ColumnType::Text);
                assert!(!from.nullable);
                assert!(to.nullable);
            }
            other => panic!("Expected one AlterColumn, got {:?}", other),
        }
    }

    #[test]
    fn test_diff_changed_constraint_is_drop_and_add() {
        let from = Model::new().with_table(author().with_constraint(Constraint::check("ck_Name", "length(Name) > 0")));
        let to = Model::new().with_table(author().with_constraint(Constraint::check("ck_Name", "length(Name) > 2")));

        let delta = assert_roundtrip(&from, &to);
        assert!(matches!(delta.operations[0], Operation::DropConstraint { .. }));
        assert!(matches!(delta.operations[1], Operation::AddConstraint { .. }));
    }

    #[test]
    fn test_diff_indexes() {
        let from = Model::new().with_table(author().with_index(Index::new("ix_Author_Name", ["Name"])));
        let to = Model::new().with_table(author().with_index(Index::unique("ux_Author_Name", ["Name"])));

        let delta = assert_roundtrip(&from, &to);
        assert!(matches!(delta.operations[0], Operation::DropIndex { .. }));
        assert!(matches!(delta.operations[1], Operation::CreateIndex { .. }));
    }

    #[test]
    fn test_diff_without_hint_is_drop_and_create() {
        let from = Model::new().with_table(author());
        let mut writer = author();
        writer.name = "Writer".into();
        let to = Model::new().with_table(writer);

        let delta = assert_roundtrip(&from, &to);
        assert!(delta.operations.iter().all(|o| !matches!(o, Operation::RenameTable { .. })));
    }

    #[test]
    fn test_diff_with_rename_hints() {
        let from = Model::new().with_table(author()).with_table(book());
        let mut writer = author();
        writer.name = "Writer".into();
        writer.columns[1].name = "FullName".into();
        let mut book = book();
        book.constraints.insert(
            "fk_Book_Author".into(),
            Constraint::foreign_key("fk_Book_Author", "AuthorId", "Writer", "AuthorId"),
        );
        let to = Model::new().with_table(writer).with_table(book);

        let hints = RenameHints::new()
            .rename_table("Author", "Writer")
            .rename_column("Writer", "Name", "FullName");
        let delta = Delta::compute_with_renames(&from, &to, &hints).unwrap();

        assert_eq!(delta.len(), 2);
        assert!(matches!(delta.operations[0], Operation::RenameTable { .. }));
        assert!(matches!(delta.operations[1], Operation::RenameColumn { .. }));

        let mut model = from.clone();
        delta.apply_to(&mut model).unwrap();
        assert_eq!(model, to);
    }

    #[test]
    fn test_diff_rejects_bad_rename_hint() {
        let model = Model::new().with_table(author());
        let hints = RenameHints::new().rename_table("Missing", "Author");

        let err = Delta::compute_with_renames(&model, &model, &hints).unwrap_err();
        assert!(matches!(err, MigrationError::UnsupportedChange { .. }));
    }

    #[test]
    fn test_diff_rejects_column_reorder() {
        let from = Model::new().with_table(author());
        let mut swapped = author();
        swapped.columns.swap(0, 1);
        let to = Model::new().with_table(swapped);

        let err = Delta::compute(&from, &to).unwrap_err();
        assert!(err.to_string().contains("reordered"));
    }

    #[test]
    fn test_diff_rejects_invalid_model() {
        let to = Model::new().with_table(book());
        assert!(matches!(
            Delta::compute(&Model::new(), &to),
            Err(MigrationError::InvalidModel { .. })
        ));
    }

    #[test]
    fn test_diff_complex_roundtrips_both_ways() {
        let tag = Table::new("Tag")
            .with_column(Column::new("TagId", ColumnType::BigInt).identity())
            .with_column(Column::new("Label", ColumnType::Varchar { length: 40 }))
            .with_constraint(Constraint::primary_key("pk_Tag", ["TagId"]))
            .with_index(Index::unique("ux_Tag_Label", ["Label"]));
        let book_tag = Table::new("BookTag")
            .with_column(Column::new("BookId", ColumnType::Integer))
            .with_column(Column::new("TagId", ColumnType::BigInt))
            .with_constraint(Constraint::primary_key("pk_BookTag", ["BookId", "TagId"]))
            .with_constraint(Constraint::foreign_key("fk_BookTag_Book", "BookId", "Book", "BookId"))
            .with_constraint(Constraint::foreign_key("fk_BookTag_Tag", "TagId", "Tag", "TagId"));
        let mut richer_book = book()
            .with_column(Column::new("Pages", ColumnType::Integer).with_default("0"))
            .with_index(Index::new("ix_Book_Title", ["Title"]));
        richer_book.columns[1] = Column::new("Title", ColumnType::Varchar { length: 300 });

        let v1 = Model::new().with_table(author()).with_table(book());
        let v2 = Model::new()
            .with_table(author())
            .with_table(richer_book)
            .with_table(tag)
            .with_table(book_tag);

        assert_roundtrip(&v1, &v2);
        assert_roundtrip(&v2, &v1);
        assert_roundtrip(&Model::new(), &v2);
        assert_roundtrip(&v2, &Model::new());
    }

    #[test]
    fn test_dependency_order_handles_cycles() {
        let a = Table::new("A")
            .with_column(Column::new("b", ColumnType::Integer))
            .with_constraint(Constraint::foreign_key("fk_a", "b", "B", "a"));
        let b = Table::new("B")
            .with_column(Column::new("a", ColumnType::Integer))
            .with_constraint(Constraint::foreign_key("fk_b", "a", "A", "b"));
        let c = Table::new("C").with_column(Column::new("x", ColumnType::Integer));

        assert_eq!(dependency_order(&[&a, &b, &c]), vec!["C", "A", "B"]);
    }

    #[test]
    fn test_diff_is_callable_concurrently() {
        let from = Model::new().with_table(author());
        let to = Model::new().with_table(author()).with_table(book());

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let (from, to) = (from.clone(), to.clone());
                std::thread::spawn(move || Delta::compute(&from, &to).unwrap())
            })
            .collect();
        let deltas: Vec<Delta> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(deltas.windows(2).all(|w| w[0] == w[1]));
    }
}
