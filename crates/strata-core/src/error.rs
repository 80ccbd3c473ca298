//! Backend error types.

use thiserror::Error;

/// Errors reported by a database [`Connection`](crate::backend::Connection).
#[derive(Debug, Error)]
pub enum Error {
    /// A statement was rejected by the database.
    #[error("statement failed: {message} (statement: {statement})")]
    Statement {
        /// The statement that failed.
        statement: String,
        /// Database error message.
        message: String,
    },

    /// A uniqueness or other integrity constraint was violated.
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    /// The database is locked by another connection.
    #[error("database busy: {0}")]
    Busy(String),

    /// Transaction control failed.
    #[error("transaction error: {0}")]
    Transaction(String),

    /// SQLite driver error.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Data read back from the database had an unexpected shape.
    #[error("invalid data: {0}")]
    InvalidData(String),
}
