//! Advisory migration lock.
//!
//! The lock is a single row in the target database. Inserting it acquires
//! the lock; the primary key makes a second insert fail while another
//! runner holds it.

use super::error::MigrationError;
use crate::backend::Connection;
use crate::dialect::{quote_ident, quote_literal};
use crate::error::Error;
use crate::storage::current_timestamp;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Default lock table name.
pub const DEFAULT_LOCK_TABLE: &str = "_strata_lock";

/// Advisory lock held by one runner at a time.
#[derive(Debug, Clone)]
pub struct MigrationLock {
    table: String,
    owner: String,
    timeout: Duration,
    poll_interval: Duration,
}

impl MigrationLock {
    /// Create a lock handle for `owner`.
    pub fn new(table: impl Into<String>, owner: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            owner: owner.into(),
            timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(100),
        }
    }

    /// Set how long [`acquire`](Self::acquire) keeps trying.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the delay between attempts.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Owner recorded on the lock row.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    fn ensure_table(&self, conn: &mut dyn Connection) -> Result<(), MigrationError> {
        conn.execute(&format!(
            "CREATE TABLE IF NOT EXISTS {} (\"id\" INTEGER NOT NULL PRIMARY KEY, \"owner\" TEXT NOT NULL, \"acquired_at\" BIGINT NOT NULL)",
            quote_ident(&self.table)
        ))?;
        Ok(())
    }

    /// Take the lock, waiting up to the configured timeout.
    ///
    /// Each attempt waits on a busy database for at most one poll interval,
    /// so a holder in the middle of a long transaction cannot stretch the
    /// wait past the timeout.
    pub fn acquire(&self, conn: &mut dyn Connection) -> Result<(), MigrationError> {
        let busy_timeout = conn.busy_timeout();
        let result = self.poll(conn);
        if let Err(e) = conn.set_busy_timeout(busy_timeout) {
            warn!(owner = %self.owner, error = %e, "failed to restore busy timeout");
        }
        result
    }

    fn poll(&self, conn: &mut dyn Connection) -> Result<(), MigrationError> {
        let started = Instant::now();
        let insert = format!(
            "INSERT INTO {} (\"id\", \"owner\", \"acquired_at\") VALUES (1, {}, {})",
            quote_ident(&self.table),
            quote_literal(&self.owner),
            current_timestamp()
        );

        loop {
            let remaining = self.timeout.saturating_sub(started.elapsed());
            conn.set_busy_timeout(self.poll_interval.min(remaining))?;
            let attempt = self
                .ensure_table(conn)
                .and_then(|_| conn.execute(&insert).map_err(MigrationError::from));
            match attempt {
                Ok(()) => {
                    debug!(owner = %self.owner, waited = ?started.elapsed(), "migration lock acquired");
                    return Ok(());
                }
                Err(MigrationError::Backend(Error::ConstraintViolation(_) | Error::Busy(_))) => {}
                Err(e) => return Err(e),
            }

            let waited = started.elapsed();
            if waited >= self.timeout {
                let holder = self
                    .holder(conn)
                    .ok()
                    .flatten()
                    .unwrap_or_else(|| "unknown".to_string());
                warn!(owner = %self.owner, %holder, ?waited, "gave up waiting for migration lock");
                return Err(MigrationError::LockTimeout { holder, waited });
            }
            debug!(owner = %self.owner, "migration lock busy, retrying");
            std::thread::sleep(self.poll_interval.min(self.timeout - waited));
        }
    }

    /// Release the lock if this owner holds it. Returns whether a row was
    /// removed.
    pub fn release(&self, conn: &mut dyn Connection) -> Result<bool, MigrationError> {
        let held = self.holder(conn)?.is_some_and(|h| h == self.owner);
        if held {
            conn.execute(&format!(
                "DELETE FROM {} WHERE \"id\" = 1 AND \"owner\" = {}",
                quote_ident(&self.table),
                quote_literal(&self.owner)
            ))?;
            debug!(owner = %self.owner, "migration lock released");
        }
        Ok(held)
    }

    /// Current holder, if the lock is taken.
    pub fn holder(&self, conn: &mut dyn Connection) -> Result<Option<String>, MigrationError> {
        if !conn.table_exists(&self.table)? {
            return Ok(None);
        }
        let rows = conn.query(&format!(
            "SELECT \"owner\" FROM {} WHERE \"id\" = 1",
            quote_ident(&self.table)
        ))?;
        Ok(rows.into_iter().next().and_then(|row| row.into_iter().next().flatten()))
    }

    /// Remove the lock regardless of owner. Returns the previous holder.
    pub fn force_release(&self, conn: &mut dyn Connection) -> Result<Option<String>, MigrationError> {
        let holder = self.holder(conn)?;
        if let Some(previous) = &holder {
            conn.execute(&format!(
                "DELETE FROM {} WHERE \"id\" = 1",
                quote_ident(&self.table)
            ))?;
            info!(previous = %previous, "migration lock force-released");
        }
        Ok(holder)
    }

    /// Run `f` while holding the lock. The lock is released on every exit
    /// path; a failed release is logged and does not mask `f`'s result.
    pub fn with_lock<T>(
        &self,
        conn: &mut dyn Connection,
        f: impl FnOnce(&mut dyn Connection) -> Result<T, MigrationError>,
    ) -> Result<T, MigrationError> {
        self.acquire(conn)?;
        let result = f(&mut *conn);
        if let Err(e) = self.release(conn) {
            warn!(owner = %self.owner, error = %e, "failed to release migration lock");
        }
        result
    }
}
