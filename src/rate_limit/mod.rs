//! Key-scoped sliding-window rate limiting.
//!
//! An attempt recorded at `T` counts against every check made before
//! `T + window`, independent of calendar alignment, so a capped key frees up
//! one slot at a time as its oldest attempts age out. Rejected attempts are not
//! recorded, which keeps retries from pushing the window further out.
//!
//! Keys are composed by the caller (`login:<email>:<ip>`); the named presets
//! below fix the key shape and limits for the app's sensitive actions.

mod client_ip;
pub mod store;

use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};

use crate::clock::Clock;
use crate::config::{AccessConfig, PresetLimits, PresetSettings};
use crate::error::{AccessError, AccessResult, StoreResult};

pub use client_ip::client_ip;
pub use store::{AttemptStore, MemoryAttemptStore, SqliteAttemptStore};

/// Human-readable wait, e.g. `15 minutes`, `1 hour`, `30 seconds`.
/// Partial minutes and hours round up so the message never understates the wait.
pub fn format_duration(secs: u64) -> String {
    fn unit(n: u64, singular: &str) -> String {
        if n == 1 {
            format!("1 {}", singular)
        } else {
            format!("{} {}s", n, singular)
        }
    }

    if secs < 60 {
        unit(secs, "second")
    } else if secs < 3600 {
        unit(secs.div_ceil(60), "minute")
    } else {
        unit(secs.div_ceil(3600), "hour")
    }
}

/// A concrete limit: which key, how many attempts, over what window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Limit {
    pub key: String,
    pub max_attempts: u32,
    pub window_secs: u64,
}

impl Limit {
    pub fn new(key: impl Into<String>, max_attempts: u32, window_secs: u64) -> Self {
        Limit {
            key: key.into(),
            max_attempts,
            window_secs,
        }
    }

    fn from_preset(key: String, limits: PresetLimits) -> Self {
        Limit::new(key, limits.max_attempts, limits.window_secs)
    }
}

pub struct RateLimiter {
    store: Arc<dyn AttemptStore>,
    clock: Arc<dyn Clock>,
    presets: PresetSettings,
    retention_floor_secs: u64,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn AttemptStore>, clock: Arc<dyn Clock>) -> Self {
        Self::from_config(store, clock, &AccessConfig::default())
    }

    pub fn from_config(
        store: Arc<dyn AttemptStore>,
        clock: Arc<dyn Clock>,
        config: &AccessConfig,
    ) -> Self {
        RateLimiter {
            store,
            clock,
            presets: config.presets.clone(),
            retention_floor_secs: config.longest_window_secs(),
        }
    }

    /// Exclusive lower bound of the sliding window ending at `now`: an attempt
    /// counts iff its timestamp is strictly greater than this.
    ///
    /// Windows too large for chrono clamp to the earliest representable
    /// instant, which makes every stored attempt count.
    fn window_start(now: DateTime<Utc>, window_secs: u64) -> DateTime<Utc> {
        i64::try_from(window_secs)
            .ok()
            .and_then(TimeDelta::try_seconds)
            .and_then(|window| now.checked_sub_signed(window))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Record an attempt for `key` unless it already has `max_attempts` inside
    /// the window. Store failures count as "over the limit".
    pub fn check_and_record(&self, key: &str, max_attempts: u32, window_secs: u64) -> bool {
        let now = self.clock.now();
        let window_start = Self::window_start(now, window_secs);
        match self
            .store
            .record_if_below(key, now, window_start, max_attempts)
        {
            Ok(allowed) => allowed,
            Err(e) => {
                log::error!("Rate limit store failed for key={}: {}", key, e);
                false
            }
        }
    }

    /// [`check_and_record`](Self::check_and_record), turning a refusal into a
    /// 429 rejection whose `Retry-After` is the full window.
    pub fn enforce(&self, key: &str, max_attempts: u32, window_secs: u64) -> AccessResult<()> {
        if self.check_and_record(key, max_attempts, window_secs) {
            Ok(())
        } else {
            log::warn!("AUDIT DENIED key={} reason=rate_limit window={}s", key, window_secs);
            Err(AccessError::rate_limited(window_secs))
        }
    }

    /// Attempts left in the current window. Read-only; fails closed to 0.
    pub fn remaining(&self, key: &str, max_attempts: u32, window_secs: u64) -> u32 {
        let window_start = Self::window_start(self.clock.now(), window_secs);
        match self.store.count_since(key, window_start) {
            Ok(count) => max_attempts.saturating_sub(count),
            Err(e) => {
                log::error!("Rate limit store failed for key={}: {}", key, e);
                0
            }
        }
    }

    /// Forget every attempt for `key`, e.g. after a successful login.
    pub fn reset(&self, key: &str) -> StoreResult<usize> {
        self.store.delete_key(key)
    }

    /// Delete attempts older than `older_than_secs` across all keys.
    ///
    /// The threshold is raised to the longest configured window so cleanup can
    /// only make checks more permissive, never stricter than real usage.
    pub fn cleanup(&self, older_than_secs: u64) -> StoreResult<usize> {
        let threshold = older_than_secs.max(self.retention_floor_secs);
        if threshold != older_than_secs {
            log::warn!(
                "Rate limit cleanup threshold raised from {}s to {}s",
                older_than_secs,
                threshold
            );
        }
        let cutoff = Self::window_start(self.clock.now(), threshold);
        let removed = self.store.delete_before(cutoff)?;
        log::info!("Rate limit cleanup removed {} attempts", removed);
        Ok(removed)
    }

    // ── Limit-based helpers ──────────────────────────────────────

    pub fn check_limit(&self, limit: &Limit) -> bool {
        self.check_and_record(&limit.key, limit.max_attempts, limit.window_secs)
    }

    pub fn enforce_limit(&self, limit: &Limit) -> AccessResult<()> {
        self.enforce(&limit.key, limit.max_attempts, limit.window_secs)
    }

    pub fn remaining_for(&self, limit: &Limit) -> u32 {
        self.remaining(&limit.key, limit.max_attempts, limit.window_secs)
    }

    // ── Presets ──────────────────────────────────────────────────

    /// `login:<identifier>:<ip>`, 5 attempts per 15 minutes by default.
    pub fn login_limit(&self, identifier: &str, client_ip: &str) -> Limit {
        Limit::from_preset(
            format!("login:{}:{}", identifier, client_ip),
            self.presets.login,
        )
    }

    /// `api:<identifier>`, 100 requests per hour by default.
    pub fn api_limit(&self, identifier: &str) -> Limit {
        Limit::from_preset(format!("api:{}", identifier), self.presets.api)
    }

    /// `password_reset:<email>:<ip>`, 3 requests per hour by default.
    pub fn password_reset_limit(&self, email: &str, client_ip: &str) -> Limit {
        Limit::from_preset(
            format!("password_reset:{}:{}", email, client_ip),
            self.presets.password_reset,
        )
    }

    pub fn enforce_login(&self, identifier: &str, client_ip: &str) -> AccessResult<()> {
        self.enforce_limit(&self.login_limit(identifier, client_ip))
    }

    pub fn enforce_api(&self, identifier: &str) -> AccessResult<()> {
        self.enforce_limit(&self.api_limit(identifier))
    }

    pub fn enforce_password_reset(&self, email: &str, client_ip: &str) -> AccessResult<()> {
        self.enforce_limit(&self.password_reset_limit(email, client_ip))
    }

    /// Clear the login counter once the user has signed in.
    pub fn reset_login(&self, identifier: &str, client_ip: &str) -> StoreResult<usize> {
        self.reset(&self.login_limit(identifier, client_ip).key)
    }
}
