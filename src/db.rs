use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::Connection;

use crate::error::{StoreError, StoreResult};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS rate_limits (
        id           INTEGER PRIMARY KEY AUTOINCREMENT,
        key          TEXT    NOT NULL,
        attempted_at INTEGER NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_rate_limits_key_time ON rate_limits(key, attempted_at);
    CREATE INDEX IF NOT EXISTS idx_rate_limits_time     ON rate_limits(attempted_at);

    CREATE TABLE IF NOT EXISTS api_keys (
        id              TEXT    PRIMARY KEY,
        owner_user_id   INTEGER NOT NULL,
        name            TEXT    NOT NULL,
        secret_hash     TEXT    NOT NULL UNIQUE,
        prefix          TEXT    NOT NULL,
        scopes          TEXT    NOT NULL DEFAULT '[]',
        hourly_quota    INTEGER NOT NULL,
        is_active       INTEGER NOT NULL DEFAULT 1,
        expires_at      TEXT,
        last_used_at    TEXT,
        created_at      TEXT    NOT NULL,
        rotated_from_id TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_api_keys_owner ON api_keys(owner_user_id);

    CREATE TABLE IF NOT EXISTS api_rate_limits (
        api_key_id    TEXT    NOT NULL,
        hour_window   TEXT    NOT NULL,
        request_count INTEGER NOT NULL,
        PRIMARY KEY (api_key_id, hour_window)
    );
";

/// Shared SQLite handle for the attempt log and the API key tables.
///
/// The connection sits behind a mutex; the counting statements issued through
/// it are each a single conditional write, so they stay atomic even when
/// several processes share the database file.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) the database file and bootstrap the schema.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> StoreResult<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub(crate) fn lock(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| StoreError::Lock(e.to_string()))
    }
}
