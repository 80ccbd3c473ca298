//! Column definitions for tables.

use super::types::ColumnType;
use serde::{Deserialize, Serialize};

/// A column definition within a table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Column {
    /// Column name.
    pub name: String,
    /// Logical column type.
    pub column_type: ColumnType,
    /// Whether the column accepts NULL.
    #[serde(default)]
    pub nullable: bool,
    /// Default value as a raw SQL expression (e.g. `0`, `'draft'`, `CURRENT_TIMESTAMP`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    /// Whether the database generates values for this column.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub identity: bool,
}

impl Column {
    /// Create a new NOT NULL column.
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable: false,
            default: None,
            identity: false,
        }
    }

    /// Create a nullable column.
    pub fn nullable(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            nullable: true,
            ..Self::new(name, column_type)
        }
    }

    /// Set the default value expression.
    pub fn with_default(mut self, expression: impl Into<String>) -> Self {
        self.default = Some(expression.into());
        self
    }

    /// Mark as an identity (auto-increment) column.
    pub fn identity(mut self) -> Self {
        self.identity = true;
        self
    }

    /// Check if this column has a default value.
    pub fn has_default(&self) -> bool {
        self.default.is_some()
    }

    /// Whether existing rows can be given a value when the column is added.
    pub fn can_add_to_populated_table(&self) -> bool {
        self.nullable || self.default.is_some() || self.identity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_column_builder() {
        let column = Column::new("status", ColumnType::Text).with_default("'draft'");

        assert_eq!(column.name, "status");
        assert!(!column.nullable);
        assert!(column.has_default());
        assert!(column.can_add_to_populated_table());
    }

    #[test]
    fn test_nullable_column() {
        let column = Column::nullable("bio", ColumnType::Text);

        assert!(column.nullable);
        assert!(!column.has_default());
        assert!(!column.identity);
    }

    #[test]
    fn test_required_column_without_default() {
        let column = Column::new("title", ColumnType::Varchar { length: 200 });
        assert!(!column.can_add_to_populated_table());
    }

    #[test]
    fn test_optional_fields_default_on_decode() {
        let column: Column =
            serde_json::from_str(r#"{"name":"id","column_type":{"type":"bigint"}}"#).unwrap();
        assert!(!column.nullable);
        assert!(!column.identity);
        assert_eq!(column.default, None);
    }
}
