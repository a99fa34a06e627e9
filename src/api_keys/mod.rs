//! API key authentication, per-key hourly quotas, and key lifecycle.
//!
//! # Credential format
//!
//! `hak_` + 40 Base62 characters from the thread-local CSPRNG, roughly 238
//! bits of entropy. Only the SHA-256 digest is stored; lookups go by digest and
//! the found row's digest is re-compared in constant time.
//!
//! # Carriers
//!
//! `X-API-Key: <secret>` or `Authorization: Bearer <secret>`. The scheme
//! comparison is case-insensitive (RFC 7235 §2.1).
//!
//! # Quota
//!
//! Each key gets `hourly_quota` requests per calendar hour, counted in
//! `api_rate_limits` by `(key id, hour bucket)`. The counter increment is a
//! single conditional upsert, so concurrent requests can't overshoot the cap.
//!
//! # Failure policy
//!
//! Unknown, revoked and expired keys all produce the same
//! [`AccessError::InvalidCredential`]. Store failures during authentication
//! fail closed; a failed `last_used_at` write is only logged.

pub mod store;
pub mod types;

use std::collections::BTreeSet;
use std::sync::Arc;

use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use rand::Rng;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::clock::{self, Clock};
use crate::context::{AuthSource, AuthorizationContext};
use crate::error::{AccessError, AccessResult, StoreResult};

pub use store::{ApiKeyStore, SqliteApiKeyStore};
pub use types::{ApiKey, ApiKeyHourWindow, NewApiKey};

/// Marks a string as a household API key.
const KEY_PREFIX: &str = "hak_";

/// Random characters after the prefix (~238 bits of entropy).
const KEY_RANDOM_LEN: usize = 40;

/// Characters of the raw key kept in `api_keys.prefix` for display, e.g.
/// `hak_Ab12`. Safe to show in listings and logs.
const DISPLAY_PREFIX_LEN: usize = 8;

/// Alphanumeric alphabet, so keys never need quoting or escaping.
const BASE62_CHARS: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// Appended once to a key's name when rotation replaces it.
const ROTATED_SUFFIX: &str = " (Rotated)";

pub const API_KEY_HEADER: &str = "x-api-key";

/// Fresh `hak_` + 40 Base62 secret from the thread-local CSPRNG.
fn generate_raw_key() -> String {
    let mut rng = rand::rng();
    let random_part: String = (0..KEY_RANDOM_LEN)
        .map(|_| BASE62_CHARS[rng.random_range(0..BASE62_CHARS.len())] as char)
        .collect();
    format!("{}{}", KEY_PREFIX, random_part)
}

/// SHA-256 of the raw key, lowercase hex. The only persisted form of the
/// secret and the lookup key for `api_keys.secret_hash`; unsalted so the
/// lookup stays an index hit.
fn hash_key(raw: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Pull the credential out of `X-API-Key`, falling back to a Bearer token.
/// Blank values count as absent.
pub fn extract_credential(headers: &HeaderMap) -> Option<String> {
    let from_header = headers
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty());

    let from_bearer = || {
        headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| {
                if v.len() > 7 && v[..7].eq_ignore_ascii_case("bearer ") {
                    Some(v[7..].trim())
                } else {
                    None
                }
            })
            .filter(|v| !v.is_empty())
    };

    from_header.or_else(from_bearer).map(str::to_string)
}

pub struct ApiKeyAuthenticator {
    store: Arc<dyn ApiKeyStore>,
    clock: Arc<dyn Clock>,
}

impl ApiKeyAuthenticator {
    pub fn new(store: Arc<dyn ApiKeyStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Authenticate a request by its headers.
    pub fn authenticate(&self, headers: &HeaderMap) -> AccessResult<AuthorizationContext> {
        match extract_credential(headers) {
            Some(secret) => self.authenticate_secret(&secret),
            None => Err(AccessError::InvalidCredential),
        }
    }

    /// Validate `secret`, charge one request against the key's hourly quota,
    /// and build the request's authorization context.
    pub fn authenticate_secret(&self, secret: &str) -> AccessResult<AuthorizationContext> {
        let now = self.clock.now();
        let hash = hash_key(secret);

        let key = match self.store.find_active_by_hash(&hash) {
            Ok(Some(key)) => key,
            Ok(None) => {
                log::warn!("AUDIT DENIED source=api_key reason=invalid_credential");
                return Err(AccessError::InvalidCredential);
            }
            Err(e) => {
                log::error!("API key lookup failed: {}", e);
                return Err(AccessError::InvalidCredential);
            }
        };

        let hash_matches: bool = key.secret_hash.as_bytes().ct_eq(hash.as_bytes()).into();
        if !hash_matches || !key.is_usable(now) {
            log::warn!(
                "AUDIT DENIED source=api_key key={} reason=invalid_credential",
                key.id
            );
            return Err(AccessError::InvalidCredential);
        }

        self.check_hourly_quota(&key, now)?;

        if let Err(e) = self.store.touch_last_used(&key.id, now) {
            log::warn!("Failed to update last_used_at for key={}: {}", key.id, e);
        }

        log::debug!("AUDIT source=api_key key={} prefix={} action=authenticate", key.id, key.prefix);

        Ok(AuthorizationContext {
            principal_id: Some(key.owner_user_id),
            permissions: key.scopes.clone(),
            rate_limit_ceiling: key.hourly_quota,
            source: AuthSource::ApiKey,
            api_key_id: Some(key.id),
        })
    }

    fn check_hourly_quota(&self, key: &ApiKey, now: DateTime<Utc>) -> AccessResult<()> {
        let bucket = clock::hour_bucket(now);
        let retry_after = clock::secs_until_next_hour(now);

        match self
            .store
            .increment_hour_window(&key.id, &bucket, key.hourly_quota)
        {
            Ok(true) => Ok(()),
            Ok(false) => {
                log::warn!(
                    "AUDIT DENIED source=api_key key={} reason=quota bucket={} quota={}",
                    key.id,
                    bucket,
                    key.hourly_quota
                );
                Err(AccessError::QuotaExceeded { retry_after })
            }
            Err(e) => {
                log::error!("API key quota check failed for key={}: {}", key.id, e);
                Err(AccessError::QuotaExceeded { retry_after })
            }
        }
    }

    /// Requests counted for `key_id` in the current hour. Does not count one.
    pub fn hourly_usage(&self, key_id: &str) -> StoreResult<u32> {
        let bucket = clock::hour_bucket(self.clock.now());
        Ok(self
            .store
            .hour_window(key_id, &bucket)?
            .map(|w| w.request_count)
            .unwrap_or(0))
    }

    /// Delete hour-bucket counters older than the current hour, across all
    /// keys. The current bucket is never touched, so a running quota is never
    /// reset early.
    pub fn cleanup_hour_windows(&self) -> StoreResult<usize> {
        let current = clock::hour_bucket(self.clock.now());
        let removed = self.store.delete_hour_windows_before(&current)?;
        log::info!("API key quota cleanup removed {} hour windows before {}", removed, current);
        Ok(removed)
    }

    fn build_key(
        &self,
        owner_user_id: i64,
        name: String,
        scopes: BTreeSet<String>,
        hourly_quota: u32,
        expires_at: Option<DateTime<Utc>>,
        rotated_from_id: Option<String>,
    ) -> (ApiKey, String) {
        let raw = generate_raw_key();
        let key = ApiKey {
            id: uuid::Uuid::new_v4().to_string(),
            owner_user_id,
            name,
            secret_hash: hash_key(&raw),
            prefix: raw[..DISPLAY_PREFIX_LEN].to_string(),
            scopes,
            hourly_quota,
            is_active: true,
            expires_at,
            last_used_at: None,
            created_at: self.clock.now(),
            rotated_from_id,
        };
        (key, raw)
    }

    /// Provision a key. The raw secret in the return value is the only copy.
    pub fn issue(&self, new: NewApiKey) -> AccessResult<(ApiKey, String)> {
        let scopes: BTreeSet<String> = new.scopes.into_iter().collect();
        let (key, raw) = self.build_key(
            new.owner_user_id,
            new.name,
            scopes,
            new.hourly_quota,
            new.expires_at,
            None,
        );
        self.store.insert(&key)?;
        log::info!(
            "AUDIT owner={} key={} prefix={} action=issue",
            key.owner_user_id,
            key.id,
            key.prefix
        );
        Ok((key, raw))
    }

    /// Replace an active key with a fresh secret carrying the same owner,
    /// scopes and quota. The old key stops authenticating immediately.
    pub fn rotate(&self, key_id: &str) -> AccessResult<(ApiKey, String)> {
        let old = match self.store.get(key_id)? {
            Some(key) if key.is_active => key,
            _ => return Err(AccessError::KeyNotFound),
        };

        let name = if old.name.ends_with(ROTATED_SUFFIX) {
            old.name.clone()
        } else {
            format!("{}{}", old.name, ROTATED_SUFFIX)
        };
        let (key, raw) = self.build_key(
            old.owner_user_id,
            name,
            old.scopes.clone(),
            old.hourly_quota,
            None,
            Some(old.id.clone()),
        );

        if !self.store.replace(&old.id, &key)? {
            // Revoked or rotated by someone else since we read it.
            return Err(AccessError::KeyNotFound);
        }

        log::info!(
            "AUDIT owner={} key={} replaced={} prefix={} action=rotate",
            key.owner_user_id,
            key.id,
            old.id,
            key.prefix
        );
        Ok((key, raw))
    }

    /// Deactivate a key for good. Returns false if it was missing or already inactive.
    pub fn revoke(&self, key_id: &str) -> AccessResult<bool> {
        let revoked = self.store.deactivate(key_id)?;
        if revoked {
            log::info!("AUDIT key={} action=revoke", key_id);
        }
        Ok(revoked)
    }

    pub fn get(&self, key_id: &str) -> AccessResult<Option<ApiKey>> {
        Ok(self.store.get(key_id)?)
    }

    pub fn list_for_owner(&self, owner_user_id: i64) -> AccessResult<Vec<ApiKey>> {
        Ok(self.store.list_for_owner(owner_user_id)?)
    }
}
