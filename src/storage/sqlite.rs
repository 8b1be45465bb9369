//! SQLite storage backend.
//!
//! Durable single-file storage for the local area. Uses WAL mode; all access
//! goes through one connection guarded by a mutex.

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

use super::{StorageBackend, StorageBus};
use crate::error::StorageError;

/// SQLite implementation of [`StorageBackend`].
pub struct SqliteBackend {
    conn: Mutex<Connection>,
    bus: StorageBus,
}

impl SqliteBackend {
    /// Open or create a SQLite store at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        info!("Opening SQLite storage at {:?}", path);

        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Self::with_connection(conn)
    }

    /// Create an in-memory SQLite store (for testing).
    pub fn in_memory() -> Result<Self, StorageError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StorageError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS storage (
                key TEXT PRIMARY KEY NOT NULL,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );
            "#,
        )?;
        debug!("SQLite storage schema initialized");

        Ok(Self {
            conn: Mutex::new(conn),
            bus: StorageBus::default(),
        })
    }

    fn now_unix_millis() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }

    fn select(conn: &Connection, key: &str) -> Result<Option<String>, StorageError> {
        let value = conn
            .query_row(
                "SELECT value FROM storage WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }
}

impl StorageBackend for SqliteBackend {
    fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        Self::select(&self.conn.lock(), key)
    }

    fn set_item(&self, key: &str, value: &str) -> Result<Option<String>, StorageError> {
        let conn = self.conn.lock();
        let previous = Self::select(&conn, key)?;
        conn.execute(
            r#"
            INSERT INTO storage (key, value, updated_at) VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
            params![key, value, Self::now_unix_millis()],
        )?;
        Ok(previous)
    }

    fn remove_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        let conn = self.conn.lock();
        let previous = Self::select(&conn, key)?;
        conn.execute("DELETE FROM storage WHERE key = ?1", params![key])?;
        Ok(previous)
    }

    fn clear(&self) -> Result<(), StorageError> {
        self.conn.lock().execute("DELETE FROM storage", [])?;
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, StorageError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT key FROM storage ORDER BY key")?;
        let keys = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(keys)
    }

    fn bus(&self) -> &StorageBus {
        &self.bus
    }
}
