//! API key records for programmatic access (`X-API-Key` or `Authorization: Bearer`).
//!
//! Raw secrets are shown once at issue/rotation and never stored in these
//! structs. Only the SHA-256 digest is persisted, with an 8-character prefix
//! kept for display.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// A stored API key. Contains metadata and the secret digest, never the secret.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApiKey {
    /// UUID v4. Never reused, including across rotations.
    pub id: String,
    pub owner_user_id: i64,
    /// Human-readable label, e.g. "Spreadsheet sync".
    pub name: String,
    /// SHA-256 hex digest of the raw secret. Unique across all keys.
    #[serde(skip_serializing)]
    pub secret_hash: String,
    /// First 8 characters of the raw secret (e.g. "hak_Ab12").
    pub prefix: String,
    pub scopes: BTreeSet<String>,
    pub hourly_quota: u32,
    /// Cleared on revoke/rotate; never set again.
    pub is_active: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    /// The key this one replaced, when created by rotation.
    pub rotated_from_id: Option<String>,
}

impl ApiKey {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// Active and not expired: the only state in which the key authenticates.
    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        self.is_active && !self.is_expired(now)
    }

    /// Display form that is safe to show after issue, e.g. `hak_Ab12…`.
    pub fn masked_preview(&self) -> String {
        format!("{}…", self.prefix)
    }
}

/// Input for provisioning a key.
#[derive(Debug, Clone)]
pub struct NewApiKey {
    pub owner_user_id: i64,
    pub name: String,
    pub scopes: Vec<String>,
    pub hourly_quota: u32,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Request counter for one key in one calendar hour.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApiKeyHourWindow {
    pub api_key_id: String,
    /// `YYYY-MM-DD HH:00:00` (UTC).
    pub hour_bucket: String,
    pub request_count: u32,
}
