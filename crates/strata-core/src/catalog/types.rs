//! Logical column types.

use serde::{Deserialize, Serialize};

/// Logical data types a column can hold.
///
/// These are dialect independent; each [`Dialect`](crate::dialect::Dialect)
/// decides how to spell them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ColumnType {
    /// Boolean value.
    Boolean,
    /// 16-bit signed integer.
    SmallInt,
    /// 32-bit signed integer.
    Integer,
    /// 64-bit signed integer.
    BigInt,
    /// 32-bit floating point.
    Real,
    /// 64-bit floating point.
    Double,
    /// Fixed-precision decimal.
    Decimal {
        /// Total number of digits.
        precision: u8,
        /// Number of digits after decimal point.
        scale: u8,
    },
    /// Unbounded UTF-8 text.
    Text,
    /// Length-limited UTF-8 text.
    Varchar {
        /// Maximum length in characters.
        length: u32,
    },
    /// Binary data.
    Bytes,
    /// Calendar date.
    Date,
    /// Time of day.
    Time,
    /// Date and time.
    Timestamp,
    /// UUID (128-bit identifier).
    Uuid,
    /// JSON document.
    Json,
}

impl ColumnType {
    /// Check if this type is an integer type.
    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            ColumnType::SmallInt | ColumnType::Integer | ColumnType::BigInt
        )
    }

    /// Check if this type is numeric.
    pub fn is_numeric(&self) -> bool {
        self.is_integer()
            || matches!(
                self,
                ColumnType::Real | ColumnType::Double | ColumnType::Decimal { .. }
            )
    }

    /// Check if this type is a string-like type.
    pub fn is_string_like(&self) -> bool {
        matches!(self, ColumnType::Text | ColumnType::Varchar { .. })
    }
}

impl std::fmt::Display for ColumnType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ColumnType::Boolean => write!(f, "boolean"),
            ColumnType::SmallInt => write!(f, "smallint"),
            ColumnType::Integer => write!(f, "integer"),
            ColumnType::BigInt => write!(f, "bigint"),
            ColumnType::Real => write!(f, "real"),
            ColumnType::Double => write!(f, "double"),
            ColumnType::Decimal { precision, scale } => {
                write!(f, "decimal({}, {})", precision, scale)
            }
            ColumnType::Text => write!(f, "text"),
            ColumnType::Varchar { length } => write!(f, "varchar({})", length),
            ColumnType::Bytes => write!(f, "bytes"),
            ColumnType::Date => write!(f, "date"),
            ColumnType::Time => write!(f, "time"),
            ColumnType::Timestamp => write!(f, "timestamp"),
            ColumnType::Uuid => write!(f, "uuid"),
            ColumnType::Json => write!(f, "json"),
        }
    }
}
