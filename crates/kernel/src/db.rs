//! Embedded database handle.
//!
//! Extension state lives in a single SQLite file. The only table the kernel
//! owns is `plugin_data`: one JSON document per extension, addressed by id.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};

/// Shared handle to the embedded SQLite database.
///
/// Cloning is cheap; all clones share one connection behind a mutex. The
/// kernel's access pattern is small single-row reads and writes, so a single
/// connection is sufficient.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) the database file and ensure the schema exists.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("failed to open database at {}", path.display()))?;

        // WAL keeps readers unblocked while the worker threads write.
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .context("failed to set database pragmas")?;

        Self::with_connection(conn)
    }

    /// Open an in-memory database. Used by tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory database")?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS plugin_data (
                plugin_id TEXT PRIMARY KEY,
                data BLOB
            );",
        )
        .context("failed to initialize database schema")?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Fetch the raw data document for one extension.
    pub fn get_plugin_data(&self, plugin_id: &str) -> rusqlite::Result<Option<Vec<u8>>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT data FROM plugin_data WHERE plugin_id = ?1",
            params![plugin_id],
            |row| row.get(0),
        )
        .optional()
    }

    /// Insert or replace the data document for one extension.
    pub fn put_plugin_data(&self, plugin_id: &str, data: &[u8]) -> rusqlite::Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO plugin_data (plugin_id, data) VALUES (?1, ?2)
             ON CONFLICT(plugin_id) DO UPDATE SET data = excluded.data",
            params![plugin_id, data],
        )?;
        Ok(())
    }

    /// Delete an extension's data document. Deleting a missing row is not an
    /// error.
    pub fn delete_plugin_data(&self, plugin_id: &str) -> rusqlite::Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM plugin_data WHERE plugin_id = ?1",
            params![plugin_id],
        )?;
        Ok(())
    }
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}
