use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::params;

use crate::db::Database;
use crate::error::StoreResult;

/// Append-only log of `(key, attempted_at)` rows.
///
/// `record_if_below` is the only write on the request path and must be a
/// single atomic check-and-insert: two callers racing on the same key can never
/// both observe "under the limit" for the last free slot.
pub trait AttemptStore: Send + Sync {
    /// Record an attempt at `at` if fewer than `max_attempts` attempts for
    /// `key` are strictly newer than `window_start`. Returns whether it was
    /// recorded.
    fn record_if_below(
        &self,
        key: &str,
        at: DateTime<Utc>,
        window_start: DateTime<Utc>,
        max_attempts: u32,
    ) -> StoreResult<bool>;

    /// Attempts for `key` strictly newer than `window_start`.
    fn count_since(&self, key: &str, window_start: DateTime<Utc>) -> StoreResult<u32>;

    fn delete_key(&self, key: &str) -> StoreResult<usize>;

    /// Delete every attempt (all keys) strictly older than `cutoff`.
    fn delete_before(&self, cutoff: DateTime<Utc>) -> StoreResult<usize>;
}

// ── SQLite ─────────────────────────────────────────────────────

/// Attempt log in the `rate_limits` table. Timestamps are epoch milliseconds.
pub struct SqliteAttemptStore {
    db: Arc<Database>,
}

impl SqliteAttemptStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }
}

impl AttemptStore for SqliteAttemptStore {
    fn record_if_below(
        &self,
        key: &str,
        at: DateTime<Utc>,
        window_start: DateTime<Utc>,
        max_attempts: u32,
    ) -> StoreResult<bool> {
        let conn = self.db.lock()?;
        let inserted = conn.execute(
            "INSERT INTO rate_limits (key, attempted_at)
             SELECT ?1, ?2
             WHERE (SELECT COUNT(*) FROM rate_limits WHERE key = ?1 AND attempted_at > ?3) < ?4",
            params![
                key,
                at.timestamp_millis(),
                window_start.timestamp_millis(),
                max_attempts
            ],
        )?;
        Ok(inserted == 1)
    }

    fn count_since(&self, key: &str, window_start: DateTime<Utc>) -> StoreResult<u32> {
        let conn = self.db.lock()?;
        let count: u32 = conn.query_row(
            "SELECT COUNT(*) FROM rate_limits WHERE key = ?1 AND attempted_at > ?2",
            params![key, window_start.timestamp_millis()],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    fn delete_key(&self, key: &str) -> StoreResult<usize> {
        let conn = self.db.lock()?;
        Ok(conn.execute("DELETE FROM rate_limits WHERE key = ?1", [key])?)
    }

    fn delete_before(&self, cutoff: DateTime<Utc>) -> StoreResult<usize> {
        let conn = self.db.lock()?;
        Ok(conn.execute(
            "DELETE FROM rate_limits WHERE attempted_at < ?1",
            [cutoff.timestamp_millis()],
        )?)
    }
}

// ── In-memory ──────────────────────────────────────────────────

/// Process-local attempt log. The count and the insert happen under one lock.
#[derive(Default)]
pub struct MemoryAttemptStore {
    attempts: Mutex<HashMap<String, VecDeque<DateTime<Utc>>>>,
}

impl MemoryAttemptStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AttemptStore for MemoryAttemptStore {
    fn record_if_below(
        &self,
        key: &str,
        at: DateTime<Utc>,
        window_start: DateTime<Utc>,
        max_attempts: u32,
    ) -> StoreResult<bool> {
        let mut attempts = self.attempts.lock().unwrap_or_else(|e| e.into_inner());
        let log = attempts.entry(key.to_string()).or_default();
        // Timestamps are appended in clock order, so everything at or before
        // `window_start` sits at the front and can never count again.
        while log.front().is_some_and(|t| *t <= window_start) {
            log.pop_front();
        }
        let in_window = log.iter().filter(|t| **t > window_start).count();
        if in_window >= max_attempts as usize {
            return Ok(false);
        }
        log.push_back(at);
        Ok(true)
    }

    fn count_since(&self, key: &str, window_start: DateTime<Utc>) -> StoreResult<u32> {
        let attempts = self.attempts.lock().unwrap_or_else(|e| e.into_inner());
        let count = attempts
            .get(key)
            .map(|log| log.iter().filter(|t| **t > window_start).count())
            .unwrap_or(0);
        Ok(count as u32)
    }

    fn delete_key(&self, key: &str) -> StoreResult<usize> {
        let mut attempts = self.attempts.lock().unwrap_or_else(|e| e.into_inner());
        Ok(attempts.remove(key).map(|log| log.len()).unwrap_or(0))
    }

    fn delete_before(&self, cutoff: DateTime<Utc>) -> StoreResult<usize> {
        let mut attempts = self.attempts.lock().unwrap_or_else(|e| e.into_inner());
        let mut removed = 0;
        for log in attempts.values_mut() {
            let before = log.len();
            log.retain(|t| *t >= cutoff);
            removed += before - log.len();
        }
        attempts.retain(|_, log| !log.is_empty());
        Ok(removed)
    }
}
