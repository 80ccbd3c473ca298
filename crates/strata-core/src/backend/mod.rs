//! Database connection capability consumed by the runner.

mod sqlite;

pub use sqlite::SqliteConnection;

use crate::dialect::Dialect;
use crate::error::Error;
use std::time::Duration;

/// One result row; every value is rendered as text, `None` for NULL.
pub type Row = Vec<Option<String>>;

/// A live connection to a target database.
///
/// Statements are executed in autocommit mode unless bracketed by
/// [`begin`](Connection::begin) and [`commit`](Connection::commit) or
/// [`rollback`](Connection::rollback).
pub trait Connection {
    /// Execute one or more statements that return no rows.
    fn execute(&mut self, statement: &str) -> Result<(), Error>;

    /// Run a query and collect its rows.
    fn query(&mut self, statement: &str) -> Result<Vec<Row>, Error>;

    /// Check whether a table exists.
    fn table_exists(&mut self, table: &str) -> Result<bool, Error>;

    /// Start a transaction.
    fn begin(&mut self) -> Result<(), Error>;

    /// Commit the open transaction.
    fn commit(&mut self) -> Result<(), Error>;

    /// Roll back the open transaction.
    fn rollback(&mut self) -> Result<(), Error>;

    /// Whether DDL statements participate in transactions.
    fn supports_transactional_ddl(&self) -> bool;

    /// Turn off foreign-key enforcement for the statements that follow and
    /// return whether it was on. Only called outside a transaction.
    fn suspend_foreign_keys(&mut self) -> Result<bool, Error> {
        Ok(false)
    }

    /// Turn foreign-key enforcement back on.
    fn resume_foreign_keys(&mut self) -> Result<(), Error> {
        Ok(())
    }

    /// Tables holding rows that violate a foreign key.
    fn foreign_key_violations(&mut self) -> Result<Vec<String>, Error> {
        Ok(Vec::new())
    }

    /// How long a single statement waits on another connection's lock.
    fn busy_timeout(&self) -> Duration {
        Duration::ZERO
    }

    /// Bound how long a single statement waits on a lock held by another
    /// connection before failing with [`Error::Busy`].
    fn set_busy_timeout(&mut self, _timeout: Duration) -> Result<(), Error> {
        Ok(())
    }

    /// SQL dialect spoken by this connection.
    fn dialect(&self) -> &'static dyn Dialect;
}
