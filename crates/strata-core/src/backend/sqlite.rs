//! SQLite connection backed by rusqlite.

use super::{Connection, Row};
use crate::dialect::{Dialect, SqliteDialect};
use crate::error::Error;
use rusqlite::types::ValueRef;
use rusqlite::{ErrorCode, OptionalExtension};
use std::path::Path;
use std::time::Duration;
use tracing::trace;

/// Default time SQLite waits on a locked database before reporting busy.
const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection to a SQLite database file.
pub struct SqliteConnection {
    conn: rusqlite::Connection,
    transactional_ddl: bool,
    busy_timeout: Duration,
}

impl SqliteConnection {
    /// Open (or create) a database file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let conn = rusqlite::Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> Result<Self, Error> {
        Self::from_connection(rusqlite::Connection::open_in_memory()?)
    }

    /// Wrap an existing rusqlite connection.
    pub fn from_connection(conn: rusqlite::Connection) -> Result<Self, Error> {
        conn.busy_timeout(DEFAULT_BUSY_TIMEOUT)?;
        Ok(Self {
            conn,
            transactional_ddl: true,
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
        })
    }

    /// Set how long SQLite waits on a locked database.
    pub fn with_busy_timeout(mut self, timeout: Duration) -> Result<Self, Error> {
        self.set_busy_timeout(timeout)?;
        Ok(self)
    }

    /// Run migrations one operation at a time instead of one transaction
    /// per migration.
    pub fn with_transactional_ddl(mut self, enabled: bool) -> Self {
        self.transactional_ddl = enabled;
        self
    }

    /// Access the underlying rusqlite connection.
    pub fn inner(&self) -> &rusqlite::Connection {
        &self.conn
    }
}

impl Connection for SqliteConnection {
    fn execute(&mut self, statement: &str) -> Result<(), Error> {
        trace!(statement, "sqlite execute");
        self.conn
            .execute_batch(statement)
            .map_err(|e| classify(statement, e))
    }

    fn query(&mut self, statement: &str) -> Result<Vec<Row>, Error> {
        trace!(statement, "sqlite query");
        let mut stmt = self
            .conn
            .prepare(statement)
            .map_err(|e| classify(statement, e))?;
        let width = stmt.column_count();
        let rows = stmt
            .query_map([], |row| {
                (0..width)
                    .map(|i| row.get_ref(i).map(render_value))
                    .collect::<rusqlite::Result<Row>>()
            })
            .map_err(|e| classify(statement, e))?;
        let collected = rows.collect::<rusqlite::Result<Vec<Row>>>();
        collected.map_err(|e| classify(statement, e))
    }

    fn table_exists(&mut self, table: &str) -> Result<bool, Error> {
        let found = self
            .conn
            .query_row(
                "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
                [table],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn begin(&mut self) -> Result<(), Error> {
        self.conn
            .execute_batch("BEGIN IMMEDIATE")
            .map_err(|e| Error::Transaction(e.to_string()))
    }

    fn commit(&mut self) -> Result<(), Error> {
        self.conn
            .execute_batch("COMMIT")
            .map_err(|e| Error::Transaction(e.to_string()))
    }

    fn rollback(&mut self) -> Result<(), Error> {
        if self.conn.is_autocommit() {
            return Ok(());
        }
        self.conn
            .execute_batch("ROLLBACK")
            .map_err(|e| Error::Transaction(e.to_string()))
    }

    fn supports_transactional_ddl(&self) -> bool {
        self.transactional_ddl
    }

    fn suspend_foreign_keys(&mut self) -> Result<bool, Error> {
        let enabled: bool = self.conn.query_row("PRAGMA foreign_keys", [], |row| row.get(0))?;
        if enabled {
            self.conn.execute_batch("PRAGMA foreign_keys = OFF")?;
        }
        Ok(enabled)
    }

    fn resume_foreign_keys(&mut self) -> Result<(), Error> {
        self.conn.execute_batch("PRAGMA foreign_keys = ON")?;
        Ok(())
    }

    fn foreign_key_violations(&mut self) -> Result<Vec<String>, Error> {
        let mut stmt = self.conn.prepare("PRAGMA foreign_key_check")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut tables = rows.collect::<rusqlite::Result<Vec<String>>>()?;
        tables.sort();
        tables.dedup();
        Ok(tables)
    }

    fn busy_timeout(&self) -> Duration {
        self.busy_timeout
    }

    fn set_busy_timeout(&mut self, timeout: Duration) -> Result<(), Error> {
        self.conn.busy_timeout(timeout)?;
        self.busy_timeout = timeout;
        Ok(())
    }

    fn dialect(&self) -> &'static dyn Dialect {
        &SqliteDialect
    }
}

fn render_value(value: ValueRef<'_>) -> Option<String> {
    match value {
        ValueRef::Null => None,
        ValueRef::Integer(i) => Some(i.to_string()),
        ValueRef::Real(f) => Some(f.to_string()),
        ValueRef::Text(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Some(hex::encode(bytes)),
    }
}

fn classify(statement: &str, err: rusqlite::Error) -> Error {
    match &err {
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation => {
            Error::ConstraintViolation(err.to_string())
        }
        rusqlite::Error::SqliteFailure(e, _)
            if matches!(e.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) =>
        {
            Error::Busy(err.to_string())
        }
        _ => Error::Statement {
            statement: statement.to_string(),
            message: err.to_string(),
        },
    }
}
