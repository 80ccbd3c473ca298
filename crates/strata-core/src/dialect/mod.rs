//! SQL rendering of migration operations.
//!
//! A [`Dialect`] turns one [`Operation`] into the statements that perform
//! it, given the model the operation is applied to.

mod postgres;
mod sqlite;

pub use postgres::PostgresDialect;
pub use sqlite::SqliteDialect;

use crate::catalog::{Column, ColumnType, Constraint, ConstraintKind, Index, Model, Table};
use crate::migration::{MigrationError, Operation};

/// Renders operations as SQL statements.
pub trait Dialect: Send + Sync {
    /// Short name, as accepted by [`dialect_by_name`].
    fn name(&self) -> &'static str;

    /// Spelling of a logical type.
    fn column_type(&self, column_type: &ColumnType) -> String;

    /// Column definition as it appears in `CREATE TABLE` and `ADD COLUMN`.
    fn column_definition(&self, column: &Column, table: &Table) -> String;

    /// Statements performing `operation` on a database whose schema is
    /// `before`.
    fn render(&self, operation: &Operation, before: &Model) -> Result<Vec<String>, MigrationError>;

    /// Table-level clause for a constraint, `None` when the constraint is
    /// expressed inline on a column.
    fn table_constraint(&self, _table: &Table, constraint: &Constraint) -> Option<String> {
        Some(constraint_clause(constraint))
    }

    /// Statements a standalone script runs before each migration's `BEGIN`.
    fn script_prelude(&self) -> &'static [&'static str] {
        &[]
    }

    /// Statements a standalone script runs after each migration's `COMMIT`.
    fn script_postlude(&self) -> &'static [&'static str] {
        &[]
    }

    /// `CREATE TABLE` statement for `table`, created under `name`.
    fn create_table(&self, table: &Table, name: &str) -> String {
        let mut lines: Vec<String> = table
            .columns
            .iter()
            .map(|c| self.column_definition(c, table))
            .collect();
        lines.extend(
            table
                .constraints
                .values()
                .filter_map(|c| self.table_constraint(table, c)),
        );
        format!("CREATE TABLE {} (\n    {}\n)", quote_ident(name), lines.join(",\n    "))
    }
}

/// Look up a dialect by its short name.
pub fn dialect_by_name(name: &str) -> Option<&'static dyn Dialect> {
    match name.to_ascii_lowercase().as_str() {
        "postgres" | "postgresql" => Some(&PostgresDialect),
        "sqlite" => Some(&SqliteDialect),
        _ => None,
    }
}

/// Double-quote an identifier.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Single-quote a string literal.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

pub(crate) fn column_list(columns: &[String]) -> String {
    columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ")
}

/// `CONSTRAINT "name" ...` clause.
pub(crate) fn constraint_clause(constraint: &Constraint) -> String {
    let body = match &constraint.kind {
        ConstraintKind::PrimaryKey => format!("PRIMARY KEY ({})", column_list(&constraint.columns)),
        ConstraintKind::Unique => format!("UNIQUE ({})", column_list(&constraint.columns)),
        ConstraintKind::Check { expression } => format!("CHECK ({})", expression),
        ConstraintKind::ForeignKey {
            references_table,
            references_columns,
            on_delete,
            on_update,
        } => format!(
            "FOREIGN KEY ({}) REFERENCES {} ({}) ON DELETE {} ON UPDATE {}",
            column_list(&constraint.columns),
            quote_ident(references_table),
            column_list(references_columns),
            on_delete.as_sql(),
            on_update.as_sql()
        ),
    };
    format!("CONSTRAINT {} {}", quote_ident(&constraint.name), body)
}

pub(crate) fn create_index(table: &str, index: &Index) -> String {
    format!(
        "CREATE {}INDEX {} ON {} ({})",
        if index.unique { "UNIQUE " } else { "" },
        quote_ident(&index.name),
        quote_ident(table),
        column_list(&index.columns)
    )
}

pub(crate) fn drop_index(index: &Index) -> String {
    format!("DROP INDEX {}", quote_ident(&index.name))
}

/// Look up a table the operation expects to exist.
pub(crate) fn existing_table<'m>(
    model: &'m Model,
    name: &str,
    operation: &Operation,
) -> Result<&'m Table, MigrationError> {
    model.table(name).ok_or_else(|| MigrationError::InvalidOperation {
        operation: operation.to_string(),
        message: format!("table '{}' does not exist", name),
    })
}

/// Model after applying `operation` to `before`.
pub(crate) fn model_after(operation: &Operation, before: &Model) -> Result<Model, MigrationError> {
    let mut after = before.clone();
    operation.apply(&mut after)?;
    Ok(after)
}
