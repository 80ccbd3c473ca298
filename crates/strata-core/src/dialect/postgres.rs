//! PostgreSQL dialect.

use super::{
    constraint_clause, create_index, drop_index, existing_table, quote_ident, Dialect,
};
use crate::catalog::{Column, ColumnType, Model, Table};
use crate::migration::{MigrationError, Operation};

/// PostgreSQL-flavoured ANSI DDL.
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresDialect;

impl Dialect for PostgresDialect {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn column_type(&self, column_type: &ColumnType) -> String {
        match column_type {
            ColumnType::Boolean => "BOOLEAN".into(),
            ColumnType::SmallInt => "SMALLINT".into(),
            ColumnType::Integer => "INTEGER".into(),
            ColumnType::BigInt => "BIGINT".into(),
            ColumnType::Real => "REAL".into(),
            ColumnType::Double => "DOUBLE PRECISION".into(),
            ColumnType::Decimal { precision, scale } => format!("NUMERIC({}, {})", precision, scale),
            ColumnType::Text => "TEXT".into(),
            ColumnType::Varchar { length } => format!("VARCHAR({})", length),
            ColumnType::Bytes => "BYTEA".into(),
            ColumnType::Date => "DATE".into(),
            ColumnType::Time => "TIME".into(),
            ColumnType::Timestamp => "TIMESTAMP".into(),
            ColumnType::Uuid => "UUID".into(),
            ColumnType::Json => "JSONB".into(),
        }
    }

    fn column_definition(&self, column: &Column, _table: &Table) -> String {
        let mut def = format!(
            "{} {}",
            quote_ident(&column.name),
            self.column_type(&column.column_type)
        );
        if column.identity {
            def.push_str(" GENERATED BY DEFAULT AS IDENTITY");
        }
        if !column.nullable {
            def.push_str(" NOT NULL");
        }
        if let (Some(default), false) = (&column.default, column.identity) {
            def.push_str(" DEFAULT ");
            def.push_str(default);
        }
        def
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
            Operation::AddColumn { table, column, .. } => {
                let owner = existing_table(before, table, operation)?;
                vec![format!(
                    "ALTER TABLE {} ADD COLUMN {}",
                    quote_ident(table),
                    self.column_definition(column, owner)
                )]
            }
            Operation::DropColumn { table, column, .. } => vec![format!(
                "ALTER TABLE {} DROP COLUMN {}",
                quote_ident(table),
                quote_ident(&column.name)
            )],
            Operation::AlterColumn { table, from, to } => self.alter_column(table, from, to),
            Operation::AddConstraint { table, constraint } => vec![format!(
                "ALTER TABLE {} ADD {}",
                quote_ident(table),
                constraint_clause(constraint)
            )],
            Operation::DropConstraint { table, constraint } => vec![format!(
                "ALTER TABLE {} DROP CONSTRAINT {}",
                quote_ident(table),
                quote_ident(&constraint.name)
            )],
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
}

impl PostgresDialect {
    fn alter_column(&self, table: &str, from: &Column, to: &Column) -> Vec<String> {
        let prefix = format!(
            "ALTER TABLE {} ALTER COLUMN {}",
            quote_ident(table),
            quote_ident(&to.name)
        );
        let mut statements = Vec::new();

        if from.identity && !to.identity {
            statements.push(format!("{} DROP IDENTITY", prefix));
        }
        if from.column_type != to.column_type {
            statements.push(format!("{} TYPE {}", prefix, self.column_type(&to.column_type)));
        }
        if from.default != to.default && !to.identity {
            match &to.default {
                Some(default) => statements.push(format!("{} SET DEFAULT {}", prefix, default)),
                None => statements.push(format!("{} DROP DEFAULT", prefix)),
            }
        }
        if from.nullable != to.nullable {
            let action = if to.nullable { "DROP" } else { "SET" };
            statements.push(format!("{} {} NOT NULL", prefix, action));
        }
        if !from.identity && to.identity {
            if from.default.is_some() {
                statements.push(format!("{} DROP DEFAULT", prefix));
            }
            statements.push(format!("{} ADD GENERATED BY DEFAULT AS IDENTITY", prefix));
        }
        statements
    }
}
