//! Database connection management.
//!
//! The [`Store`] struct owns a single [`rusqlite::Connection`] behind a
//! mutex so it can be shared across tokio workers; write volume is dominated
//! by human-paced client actions, so one serialized connection is enough.
//!
//! Foreign-key enforcement stays off: nameplates reference mailboxes, but
//! the two are torn down on independent schedules (a mailbox is deleted on
//! last close while its nameplate may outlive it until release).

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use rusqlite::Connection;

use crate::error::StoreError;
use crate::schema::{RELAY_SCHEMA, SCHEMA_VERSION};
use crate::Result;

pub struct Store {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").field("path", &self.path).finish()
    }
}

impl Store {
    /// Open (or create) a database at the given path.
    ///
    /// A fresh, empty database gets the schema created and the version row
    /// written. A non-empty database must carry a `version` row equal to
    /// [`SCHEMA_VERSION`]; a missing row is treated as corruption.
    pub fn open_at(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;

        conn.pragma_update(None, "journal_mode", "WAL")?;

        let tables: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'",
            [],
            |row| row.get(0),
        )?;

        if tables == 0 {
            tracing::info!(path = %path.display(), "creating relay schema");
            conn.execute_batch(RELAY_SCHEMA)?;
            conn.execute(
                "INSERT INTO version (version) VALUES (?1)",
                [SCHEMA_VERSION],
            )?;
        } else {
            let has_version_table: i64 = conn.query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'version'",
                [],
                |row| row.get(0),
            )?;
            if has_version_table == 0 {
                return Err(StoreError::Corrupt);
            }

            let current: i64 = conn
                .query_row("SELECT version FROM version", [], |row| row.get(0))
                .map_err(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => StoreError::Corrupt,
                    other => StoreError::Sqlite(other),
                })?;

            if current != SCHEMA_VERSION {
                return Err(StoreError::Version {
                    found: current,
                    expected: SCHEMA_VERSION,
                });
            }
        }

        tracing::info!(path = %path.display(), "database connection opened");

        Ok(Self {
            conn: Mutex::new(conn),
            path: path.to_path_buf(),
        })
    }

    /// Filesystem path of the open database.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
