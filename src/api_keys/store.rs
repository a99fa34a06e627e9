use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, OptionalExtension, Row};

use super::types::{ApiKey, ApiKeyHourWindow};
use crate::db::Database;
use crate::error::StoreResult;

/// Persistence for API keys and their per-hour request counters.
pub trait ApiKeyStore: Send + Sync {
    fn insert(&self, key: &ApiKey) -> StoreResult<()>;

    fn get(&self, id: &str) -> StoreResult<Option<ApiKey>>;

    /// The active key whose secret digest equals `secret_hash`, if any.
    /// Expiry is left to the caller.
    fn find_active_by_hash(&self, secret_hash: &str) -> StoreResult<Option<ApiKey>>;

    fn list_for_owner(&self, owner_user_id: i64) -> StoreResult<Vec<ApiKey>>;

    /// Flip `is_active` off. Returns false if the key was missing or already inactive.
    fn deactivate(&self, id: &str) -> StoreResult<bool>;

    /// Atomically deactivate `old_id` and insert `replacement`. Returns false,
    /// with no changes, if `old_id` is missing or already inactive.
    fn replace(&self, old_id: &str, replacement: &ApiKey) -> StoreResult<bool>;

    fn touch_last_used(&self, id: &str, at: DateTime<Utc>) -> StoreResult<()>;

    /// Count one request in `hour_bucket` if the bucket is still below `quota`.
    /// Creates the bucket on first use. Returns whether the request was counted.
    fn increment_hour_window(&self, id: &str, hour_bucket: &str, quota: u32) -> StoreResult<bool>;

    fn hour_window(&self, id: &str, hour_bucket: &str) -> StoreResult<Option<ApiKeyHourWindow>>;

    /// Drop every key's counters for buckets strictly before `hour_bucket`.
    /// Bucket strings sort chronologically, so this is a plain string compare.
    fn delete_hour_windows_before(&self, hour_bucket: &str) -> StoreResult<usize>;
}

const KEY_COLUMNS: &str = "id, owner_user_id, name, secret_hash, prefix, scopes, hourly_quota, \
                           is_active, expires_at, last_used_at, created_at, rotated_from_id";

fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parse_opt_ts(idx: usize, raw: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    raw.map(|s| parse_ts(idx, &s)).transpose()
}

fn row_to_key(row: &Row<'_>) -> rusqlite::Result<ApiKey> {
    let scopes_json: String = row.get(5)?;
    let scopes: BTreeSet<String> = serde_json::from_str(&scopes_json)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(5, Type::Text, Box::new(e)))?;
    let created_at: String = row.get(10)?;

    Ok(ApiKey {
        id: row.get(0)?,
        owner_user_id: row.get(1)?,
        name: row.get(2)?,
        secret_hash: row.get(3)?,
        prefix: row.get(4)?,
        scopes,
        hourly_quota: row.get(6)?,
        is_active: row.get(7)?,
        expires_at: parse_opt_ts(8, row.get(8)?)?,
        last_used_at: parse_opt_ts(9, row.get(9)?)?,
        created_at: parse_ts(10, &created_at)?,
        rotated_from_id: row.get(11)?,
    })
}

fn insert_key(conn: &rusqlite::Connection, key: &ApiKey) -> StoreResult<()> {
    let scopes = serde_json::to_string(&key.scopes)?;
    conn.execute(
        &format!("INSERT INTO api_keys ({KEY_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"),
        params![
            key.id,
            key.owner_user_id,
            key.name,
            key.secret_hash,
            key.prefix,
            scopes,
            key.hourly_quota,
            key.is_active,
            key.expires_at.map(|t| t.to_rfc3339()),
            key.last_used_at.map(|t| t.to_rfc3339()),
            key.created_at.to_rfc3339(),
            key.rotated_from_id,
        ],
    )?;
    Ok(())
}

/// SQLite-backed key store over the `api_keys` and `api_rate_limits` tables.
pub struct SqliteApiKeyStore {
    db: Arc<Database>,
}

impl SqliteApiKeyStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }
}

impl ApiKeyStore for SqliteApiKeyStore {
    fn insert(&self, key: &ApiKey) -> StoreResult<()> {
        let conn = self.db.lock()?;
        insert_key(&conn, key)
    }

    fn get(&self, id: &str) -> StoreResult<Option<ApiKey>> {
        let conn = self.db.lock()?;
        let key = conn
            .query_row(
                &format!("SELECT {KEY_COLUMNS} FROM api_keys WHERE id = ?1"),
                [id],
                row_to_key,
            )
            .optional()?;
        Ok(key)
    }

    fn find_active_by_hash(&self, secret_hash: &str) -> StoreResult<Option<ApiKey>> {
        let conn = self.db.lock()?;
        let key = conn
            .query_row(
                &format!("SELECT {KEY_COLUMNS} FROM api_keys WHERE secret_hash = ?1 AND is_active = 1"),
                [secret_hash],
                row_to_key,
            )
            .optional()?;
        Ok(key)
    }

    fn list_for_owner(&self, owner_user_id: i64) -> StoreResult<Vec<ApiKey>> {
        let conn = self.db.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {KEY_COLUMNS} FROM api_keys WHERE owner_user_id = ?1 ORDER BY created_at DESC"
        ))?;
        let rows = stmt.query_map([owner_user_id], row_to_key)?;

        let mut keys = Vec::new();
        for row in rows {
            keys.push(row?);
        }
        Ok(keys)
    }

    fn deactivate(&self, id: &str) -> StoreResult<bool> {
        let conn = self.db.lock()?;
        let changed = conn.execute(
            "UPDATE api_keys SET is_active = 0 WHERE id = ?1 AND is_active = 1",
            [id],
        )?;
        Ok(changed == 1)
    }

    fn replace(&self, old_id: &str, replacement: &ApiKey) -> StoreResult<bool> {
        let conn = self.db.lock()?;
        let tx = conn.unchecked_transaction()?;

        let changed = tx.execute(
            "UPDATE api_keys SET is_active = 0 WHERE id = ?1 AND is_active = 1",
            [old_id],
        )?;
        if changed != 1 {
            // Dropping the transaction rolls it back.
            return Ok(false);
        }

        insert_key(&tx, replacement)?;
        tx.commit()?;
        Ok(true)
    }

    fn touch_last_used(&self, id: &str, at: DateTime<Utc>) -> StoreResult<()> {
        let conn = self.db.lock()?;
        conn.execute(
            "UPDATE api_keys SET last_used_at = ?2 WHERE id = ?1",
            params![id, at.to_rfc3339()],
        )?;
        Ok(())
    }

    fn increment_hour_window(&self, id: &str, hour_bucket: &str, quota: u32) -> StoreResult<bool> {
        if quota == 0 {
            return Ok(false);
        }
        let conn = self.db.lock()?;
        let changed = conn.execute(
            "INSERT INTO api_rate_limits (api_key_id, hour_window, request_count)
             VALUES (?1, ?2, 1)
             ON CONFLICT(api_key_id, hour_window)
             DO UPDATE SET request_count = request_count + 1
             WHERE request_count < ?3",
            params![id, hour_bucket, quota],
        )?;
        Ok(changed == 1)
    }

    fn hour_window(&self, id: &str, hour_bucket: &str) -> StoreResult<Option<ApiKeyHourWindow>> {
        let conn = self.db.lock()?;
        let window = conn
            .query_row(
                "SELECT api_key_id, hour_window, request_count FROM api_rate_limits
                 WHERE api_key_id = ?1 AND hour_window = ?2",
                [id, hour_bucket],
                |row| {
                    Ok(ApiKeyHourWindow {
                        api_key_id: row.get(0)?,
                        hour_bucket: row.get(1)?,
                        request_count: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(window)
    }

    fn delete_hour_windows_before(&self, hour_bucket: &str) -> StoreResult<usize> {
        let conn = self.db.lock()?;
        Ok(conn.execute(
            "DELETE FROM api_rate_limits WHERE hour_window < ?1",
            [hour_bucket],
        )?)
    }
}
