//! Database handle — one SQLite connection, strict write serialisation.
//!
//! All writers funnel through [`Database::with_conn`] / [`Database::with_tx`],
//! which take the connection mutex for the duration of the closure. Busy/lock
//! failures are retried twice before surfacing as
//! [`EngramError::StorageConflict`] per the error-handling contract.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{Connection, TransactionBehavior};
use tracing::{debug, info, warn};

use crate::error::{EngramError, Result};
use crate::migrations;

/// Retries applied to a busy write before surfacing a storage conflict.
const BUSY_RETRIES: usize = 2;

pub struct Database {
    conn: Mutex<Connection>,
    path: String,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").field("path", &self.path).finish()
    }
}

impl Database {
    /// Open (creating if absent) and migrate the database at `path`.
    /// `":memory:"` opens a process-private in-memory database.
    pub fn open(path: &str) -> Result<Self> {
        let conn = if path == ":memory:" {
            Connection::open_in_memory()?
        } else {
            if let Some(parent) = Path::new(path).parent() {
                std::fs::create_dir_all(parent)?;
            }
            Connection::open(path)?
        };

        // WAL gives concurrent readers; in-memory databases reject it, which
        // is fine — they are single-handle anyway.
        if path != ":memory:" {
            let mode: String =
                conn.pragma_update_and_check(None, "journal_mode", "wal", |row| row.get(0))?;
            debug!(mode, "journal mode set");
        }
        conn.pragma_update(None, "foreign_keys", "on")?;
        conn.pragma_update(None, "busy_timeout", 5000)?;

        migrations::run(&conn)?;
        info!(path, version = migrations::CURRENT_VERSION, "database open");

        Ok(Self {
            conn: Mutex::new(conn),
            path: path.to_string(),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Run `f` with the connection lock held. Suitable for reads and
    /// single-statement writes.
    pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn.lock().expect("connection mutex poisoned");
        f(&conn)
    }

    /// Run `f` inside an immediate transaction, retrying busy failures.
    ///
    /// The closure must be safe to re-run: nothing it did in a failed attempt
    /// is visible, since the transaction rolled back.
    pub fn with_tx<T>(&self, mut f: impl FnMut(&rusqlite::Transaction) -> Result<T>) -> Result<T> {
        let mut conn = self.conn.lock().expect("connection mutex poisoned");
        let mut last_busy: Option<EngramError> = None;

        for attempt in 0..=BUSY_RETRIES {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            match f(&tx) {
                Ok(value) => {
                    tx.commit()?;
                    return Ok(value);
                }
                Err(err) if err.is_busy() && attempt < BUSY_RETRIES => {
                    warn!(attempt, "transaction hit busy database — retrying");
                    drop(tx);
                    last_busy = Some(err);
                }
                Err(err) if err.is_busy() => {
                    return Err(EngramError::StorageConflict(err.to_string()));
                }
                Err(err) => return Err(err),
            }
        }

        // Unreachable in practice; keeps the loop total.
        Err(EngramError::StorageConflict(
            last_busy.map(|e| e.to_string()).unwrap_or_default(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_in_memory_and_migrates() {
        let db = Database::open(":memory:").unwrap();
        db.with_conn(|conn| {
            let version: i64 =
                conn.query_row("SELECT version FROM schema_version WHERE id = 1", [], |r| {
                    r.get(0)
                })?;
            assert_eq!(version, migrations::CURRENT_VERSION);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn reopening_a_file_preserves_schema_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engram.db");
        let path_str = path.to_str().unwrap();
        drop(Database::open(path_str).unwrap());
        let db = Database::open(path_str).unwrap();
        assert_eq!(db.path(), path_str);
    }

    #[test]
    fn transactions_commit_atomically() {
        let db = Database::open(":memory:").unwrap();
        let result: Result<()> = db.with_tx(|tx| {
            tx.execute(
                "INSERT INTO entities (id, canonical_name, kind, created_at, updated_at)
                 VALUES ('e1', 'A', 'person', '2026-01-01T00:00:00.000000Z', '2026-01-01T00:00:00.000000Z')",
                [],
            )?;
            Err(EngramError::InputInvalid("force rollback".into()))
        });
        assert!(result.is_err());
        db.with_conn(|conn| {
            let count: i64 = conn.query_row("SELECT count(*) FROM entities", [], |r| r.get(0))?;
            assert_eq!(count, 0);
            Ok(())
        })
        .unwrap();
    }
}
