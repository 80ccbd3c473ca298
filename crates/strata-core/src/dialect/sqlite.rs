//! SQLite dialect.
//!
//! SQLite's `ALTER TABLE` only renames tables and columns, appends columns
//! and drops unconstrained columns. Every other change to an existing table
//! is performed by a rebuild: create the new shape under a temporary name,
//! copy the surviving columns, drop the old table and rename the new one
//! into place.
//!
//! Dropping a referenced table with foreign keys enforced deletes or rejects
//! the referencing rows, so a rebuild must run on a connection whose
//! enforcement is off (see [`Connection::suspend_foreign_keys`]).
//!
//! [`Connection::suspend_foreign_keys`]: crate::backend::Connection::suspend_foreign_keys

use super::{
    constraint_clause, create_index, drop_index, existing_table, model_after, quote_ident,
    column_list, Dialect,
};
use crate::catalog::{Column, ColumnType, Constraint, ConstraintKind, Model, Table};
use crate::migration::{MigrationError, Operation};

/// Prefix of the temporary table used during a rebuild.
const REBUILD_PREFIX: &str = "__strata_new_";

/// SQLite DDL.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteDialect;

impl Dialect for SqliteDialect {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn column_type(&self, column_type: &ColumnType) -> String {
        match column_type {
            ColumnType::Boolean => "BOOLEAN".into(),
            ColumnType::SmallInt => "SMALLINT".into(),
            ColumnType::Integer => "INTEGER".into(),
            ColumnType::BigInt => "BIGINT".into(),
            ColumnType::Real => "REAL".into(),
            ColumnType::Double => "DOUBLE".into(),
            ColumnType::Decimal { precision, scale } => format!("NUMERIC({}, {})", precision, scale),
            ColumnType::Varchar { length } => format!("VARCHAR({})", length),
            ColumnType::Bytes => "BLOB".into(),
            // Keep TEXT affinity so values are stored as written.
            ColumnType::Text
            | ColumnType::Date
            | ColumnType::Time
            | ColumnType::Timestamp
            | ColumnType::Uuid
            | ColumnType::Json => "TEXT".into(),
        }
    }

    fn column_definition(&self, column: &Column, table: &Table) -> String {
        if let Some(pk) = rowid_primary_key(table).filter(|pk| pk.columns[0] == column.name) {
            return format!(
                "{} INTEGER NOT NULL CONSTRAINT {} PRIMARY KEY AUTOINCREMENT",
                quote_ident(&column.name),
                quote_ident(&pk.name)
            );
        }
        let mut def = format!(
            "{} {}",
            quote_ident(&column.name),
            self.column_type(&column.column_type)
        );
        if !column.nullable {
            def.push_str(" NOT NULL");
        }
        if let Some(default) = &column.default {
            def.push_str(" DEFAULT ");
            def.push_str(default);
        }
        def
    }

    fn table_constraint(&self, table: &Table, constraint: &Constraint) -> Option<String> {
        match rowid_primary_key(table) {
            Some(pk) if pk.name == constraint.name => None,
            _ => Some(constraint_clause(constraint)),
        }
    }

    fn render(&self, operation: &Operation, before: &Model) -> Result<Vec<String>, MigrationError> {
        let statements = match operation {
            Operation::CreateTable { table } => {
                let mut statements = vec![self.create_table(table, &table.name)];
                statements.extend(table.indexes.values().map(|i| create_index(&table.name, i)));
                statements
            }
            Operation::DropTable { table } => {
                vec![format!("DROP TABLE {}", quote_ident(&table.name))]
            }
            Operation::AddColumn {
                table,
                column,
                position,
            } => {
                let current = existing_table(before, table, operation)?;
                let appends = *position == current.columns.len();
                if appends && column.can_add_to_populated_table() && !column.identity {
                    vec![format!(
                        "ALTER TABLE {} ADD COLUMN {}",
                        quote_ident(table),
                        self.column_definition(column, current)
                    )]
                } else {
                    self.rebuild(operation, before, table)?
                }
            }
            Operation::DropColumn { table, column, .. } => {
                let current = existing_table(before, table, operation)?;
                if can_drop_natively(current, &column.name) {
                    vec![format!(
                        "ALTER TABLE {} DROP COLUMN {}",
                        quote_ident(table),
                        quote_ident(&column.name)
                    )]
                } else {
                    self.rebuild(operation, before, table)?
                }
            }
            Operation::AlterColumn { table, .. }
            | Operation::AddConstraint { table, .. }
            | Operation::DropConstraint { table, .. } => self.rebuild(operation, before, table)?,
            Operation::CreateIndex { table, index } => vec![create_index(table, index)],
            Operation::DropIndex { index, .. } => vec![drop_index(index)],
            Operation::RenameTable { from, to } => vec![format!(
                "ALTER TABLE {} RENAME TO {}",
                quote_ident(from),
                quote_ident(to)
            )],
            Operation::RenameColumn { table, from, to } => vec![format!(
                "ALTER TABLE {} RENAME COLUMN {} TO {}",
                quote_ident(table),
                quote_ident(from),
                quote_ident(to)
            )],
            Operation::Sql { sql, .. } => vec![sql.clone()],
        };
        Ok(statements)
    }

    // `foreign_keys` cannot change inside a transaction.
    fn script_prelude(&self) -> &'static [&'static str] {
        &["PRAGMA foreign_keys = OFF"]
    }

    fn script_postlude(&self) -> &'static [&'static str] {
        &["PRAGMA foreign_keys = ON"]
    }
}

impl SqliteDialect {
    /// Replace `table` with the shape it has after `operation`.
    fn rebuild(
        &self,
        operation: &Operation,
        before: &Model,
        table: &str,
    ) -> Result<Vec<String>, MigrationError> {
        let old = existing_table(before, table, operation)?;
        let after = model_after(operation, before)?;
        let new = existing_table(&after, table, operation)?;
        let temporary = format!("{}{}", REBUILD_PREFIX, table);

        let mut statements = vec![self.create_table(new, &temporary)];

        let shared: Vec<String> = new
            .columns
            .iter()
            .filter(|c| old.has_column(&c.name))
            .map(|c| c.name.clone())
            .collect();
        if !shared.is_empty() {
            let columns = column_list(&shared);
            statements.push(format!(
                "INSERT INTO {} ({}) SELECT {} FROM {}",
                quote_ident(&temporary),
                columns,
                columns,
                quote_ident(table)
            ));
        }

        statements.push(format!("DROP TABLE {}", quote_ident(table)));
        statements.push(format!(
            "ALTER TABLE {} RENAME TO {}",
            quote_ident(&temporary),
            quote_ident(table)
        ));
        statements.extend(new.indexes.values().map(|i| create_index(table, i)));
        Ok(statements)
    }
}

/// A single-column identity primary key on an integer column becomes
/// SQLite's `INTEGER PRIMARY KEY AUTOINCREMENT` rowid alias.
fn rowid_primary_key(table: &Table) -> Option<&Constraint> {
    let pk = table.primary_key()?;
    if pk.columns.len() != 1 {
        return None;
    }
    let column = table.column(&pk.columns[0])?;
    (column.identity && column.column_type.is_integer()).then_some(pk)
}

/// `ALTER TABLE ... DROP COLUMN` refuses columns that take part in a key,
/// an index or a check.
fn can_drop_natively(table: &Table, column: &str) -> bool {
    let constrained = table.constraints.values().any(|c| {
        c.columns.iter().any(|name| name == column) || matches!(c.kind, ConstraintKind::Check { .. })
    });
    let indexed = table
        .indexes
        .values()
        .any(|i| i.columns.iter().any(|name| name == column));
    !constrained && !indexed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Connection, SqliteConnection};
    use crate::catalog::Index;

    fn author() -> Table {
        Table::new("Author")
            .with_column(Column::new("AuthorId", ColumnType::Integer).identity())
            .with_column(Column::new("Name", ColumnType::Text))
            .with_constraint(Constraint::primary_key("pk_Author", ["AuthorId"]))
            .with_index(Index::new("ix_Author_Name", ["Name"]))
    }

    /// Render and run `op` against a live database whose schema is `model`.
    fn run(conn: &mut SqliteConnection, model: &mut Model, op: Operation) -> Vec<String> {
        let statements = SqliteDialect.render(&op, model).unwrap();
        for statement in &statements {
            conn.execute(statement).unwrap();
        }
        op.apply(model).unwrap();
        statements
    }

    #[test]
    fn test_create_table_uses_rowid_alias() {
        let statements = SqliteDialect
            .render(&Operation::CreateTable { table: author() }, &Model::new())
            .unwrap();

        assert_eq!(
            statements[0],
            "CREATE TABLE \"Author\" (\n    \"AuthorId\" INTEGER NOT NULL CONSTRAINT \"pk_Author\" PRIMARY KEY AUTOINCREMENT,\n    \"Name\" TEXT NOT NULL\n)"
        );
        assert_eq!(statements.len(), 2);
    }

    #[test]
    fn test_append_nullable_column_is_native() {
        let model = Model::new().with_table(author());
        let op = Operation::AddColumn {
            table: "Author".into(),
            column: Column::nullable("Email", ColumnType::Text),
            position: 2,
        };

        assert_eq!(
            SqliteDialect.render(&op, &model).unwrap(),
            vec!["ALTER TABLE \"Author\" ADD COLUMN \"Email\" TEXT"]
        );
    }

    #[test]
    fn test_alter_column_rebuilds_and_keeps_rows() {
        let mut conn = SqliteConnection::open_in_memory().unwrap();
        let mut model = Model::new();
        run(&mut conn, &mut model, Operation::CreateTable { table: author() });
        conn.execute("INSERT INTO \"Author\" (\"Name\") VALUES ('Le Guin'), ('Banks')")
            .unwrap();

        let statements = run(
            &mut conn,
            &mut model,
            Operation::AlterColumn {
                table: "Author".into(),
                from: Column::new("Name", ColumnType::Text),
                to: Column::nullable("Name", ColumnType::Varchar { length: 80 }),
            },
        );

        assert!(statements[0].starts_with("CREATE TABLE \"__strata_new_Author\""));
        assert!(statements.iter().any(|s| s.starts_with("INSERT INTO")));
        assert_eq!(
            statements.last().unwrap(),
            "CREATE INDEX \"ix_Author_Name\" ON \"Author\" (\"Name\")"
        );

        let rows = conn
            .query("SELECT \"AuthorId\", \"Name\" FROM \"Author\" ORDER BY \"AuthorId\"")
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1][1].as_deref(), Some("Banks"));
        conn.execute("INSERT INTO \"Author\" (\"Name\") VALUES (NULL)").unwrap();
    }

    #[test]
    fn test_constraint_changes_rebuild() {
        let mut conn = SqliteConnection::open_in_memory().unwrap();
        let mut model = Model::new();
        run(&mut conn, &mut model, Operation::CreateTable { table: author() });
        run(
            &mut conn,
            &mut model,
            Operation::CreateTable {
                table: Table::new("Book")
                    .with_column(Column::new("BookId", ColumnType::Integer))
                    .with_column(Column::new("AuthorId", ColumnType::Integer)),
            },
        );

        let fk = Constraint::foreign_key("fk_Book_Author", "AuthorId", "Author", "AuthorId");
        run(
            &mut conn,
            &mut model,
            Operation::AddConstraint {
                table: "Book".into(),
                constraint: fk.clone(),
            },
        );
        let schema = conn
            .query("SELECT sql FROM sqlite_master WHERE name = 'Book'")
            .unwrap();
        assert!(schema[0][0].as_deref().unwrap().contains("fk_Book_Author"));

        run(
            &mut conn,
            &mut model,
            Operation::DropConstraint {
                table: "Book".into(),
                constraint: fk,
            },
        );
        let schema = conn
            .query("SELECT sql FROM sqlite_master WHERE name = 'Book'")
            .unwrap();
        assert!(!schema[0][0].as_deref().unwrap().contains("fk_Book_Author"));
    }

    #[test]
    fn test_drop_column_native_or_rebuild() {
        let model = Model::new().with_table(author().with_column(Column::nullable("Bio", ColumnType::Text)));

        let native = Operation::DropColumn {
            table: "Author".into(),
            column: Column::nullable("Bio", ColumnType::Text),
            position: 2,
        };
        assert_eq!(
            SqliteDialect.render(&native, &model).unwrap(),
            vec!["ALTER TABLE \"Author\" DROP COLUMN \"Bio\""]
        );

        let mut bare = author();
        bare.indexes.clear();
        bare.constraints.clear();
        let model = Model::new().with_table(bare.with_index(Index::new("ix_Author_Name", ["Name"])));
        let indexed = Operation::DropColumn {
            table: "Author".into(),
            column: Column::new("Name", ColumnType::Text),
            position: 1,
        };
        // An index still covering the column fails the precondition.
        assert!(SqliteDialect.render(&indexed, &model).is_err());
    }
}
