//! SQLite-backed durable queue.
//!
//! Requests live in a single table keyed by an `AUTOINCREMENT` rowid, so ids
//! follow insertion order and a deleted id is never handed out again. The
//! same database keeps small session settings such as the generated device id.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};

use super::{DurableQueue, PersistedId, QueuedRequest};
use crate::error::QueueError;
use crate::protocol::RequestDescriptor;

/// Complete DDL for the queue database.
///
/// Uses `IF NOT EXISTS` throughout so applying it is idempotent.
const SCHEMA_SQL: &str = r#"
-- WAL keeps readers off the writer's lock; FULL syncs every commit.
PRAGMA journal_mode = WAL;
PRAGMA synchronous = FULL;

CREATE TABLE IF NOT EXISTS pending_requests (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    url        TEXT NOT NULL,
    created_at INTEGER NOT NULL   -- Unix milliseconds
);

CREATE TABLE IF NOT EXISTS settings (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// Settings key for the generated device identifier
const DEVICE_ID_KEY: &str = "device_id";

/// SQLite-backed request queue
///
/// Thread-safe via an internal `Mutex<Connection>`; all operations are
/// serialized.
pub struct SqliteQueue {
    path: PathBuf,
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for SqliteQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteQueue")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl SqliteQueue {
    /// Open (or create) the queue database at `path`
    ///
    /// # Errors
    ///
    /// Returns error if the parent directory cannot be created or the
    /// database cannot be opened.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, QueueError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA_SQL)?;

        let queue = Self {
            path: path.to_path_buf(),
            conn: Mutex::new(conn),
        };
        info!(
            "Opened request queue at {} ({} pending)",
            path.display(),
            queue.count()?
        );
        Ok(queue)
    }

    /// Database file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Return the stored device id, storing `generate()` first if absent
    pub fn device_id_or_insert_with<F>(&self, generate: F) -> Result<String, QueueError>
    where
        F: FnOnce() -> String,
    {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR IGNORE INTO settings (key, value) VALUES (?1, ?2)",
            params![DEVICE_ID_KEY, generate()],
        )?;
        let id = conn.query_row(
            "SELECT value FROM settings WHERE key = ?1",
            params![DEVICE_ID_KEY],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, QueueError> {
        self.conn.lock().map_err(|_| QueueError::Poisoned)
    }
}

impl DurableQueue for SqliteQueue {
    fn append(&self, request: &RequestDescriptor) -> Result<PersistedId, QueueError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO pending_requests (url, created_at) VALUES (?1, ?2)",
            params![request.url(), Utc::now().timestamp_millis()],
        )?;
        let id = PersistedId::new(conn.last_insert_rowid());
        debug!("Queued request {}", id);
        Ok(id)
    }

    fn peek_oldest(&self) -> Result<Option<QueuedRequest>, QueueError> {
        let conn = self.lock()?;
        let head = conn
            .query_row(
                "SELECT id, url FROM pending_requests ORDER BY id ASC LIMIT 1",
                [],
                |row| {
                    Ok(QueuedRequest {
                        id: PersistedId::new(row.get(0)?),
                        request: RequestDescriptor::new(row.get(1)?),
                    })
                },
            )
            .optional()?;
        Ok(head)
    }

    fn remove(&self, id: PersistedId) -> Result<bool, QueueError> {
        let conn = self.lock()?;
        let deleted = conn.execute(
            "DELETE FROM pending_requests WHERE id = ?1",
            params![id.get()],
        )?;
        if deleted == 0 {
            debug!("Request {} already removed", id);
        }
        Ok(deleted > 0)
    }

    fn count(&self) -> Result<usize, QueueError> {
        let conn = self.lock()?;
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM pending_requests", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}
