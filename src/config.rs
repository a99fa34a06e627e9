use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub const CONFIG_ENV: &str = "HOUSEHOLD_ACCESS_CONFIG";
pub const DATABASE_ENV: &str = "HOUSEHOLD_ACCESS_DB";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Where the CSRF token lives on the way in and in the session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CsrfSettings {
    pub field_name: String,
    pub header_name: String,
    pub session_key: String,
}

impl Default for CsrfSettings {
    fn default() -> Self {
        CsrfSettings {
            field_name: "csrf_token".into(),
            header_name: "x-csrf-token".into(),
            session_key: "csrf_token".into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresetLimits {
    pub max_attempts: u32,
    pub window_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PresetSettings {
    pub login: PresetLimits,
    pub api: PresetLimits,
    pub password_reset: PresetLimits,
}

impl Default for PresetSettings {
    fn default() -> Self {
        PresetSettings {
            login: PresetLimits {
                max_attempts: 5,
                window_secs: 900,
            },
            api: PresetLimits {
                max_attempts: 100,
                window_secs: 3600,
            },
            password_reset: PresetLimits {
                max_attempts: 3,
                window_secs: 3600,
            },
        }
    }
}

/// Access-control settings. Every field has a default, so an absent or
/// partial `access.json` is valid.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessConfig {
    pub database_path: PathBuf,
    pub csrf: CsrfSettings,
    pub presets: PresetSettings,
    /// Proxy headers consulted for the client address, highest priority first.
    /// Only list headers set by a reverse proxy this deployment actually sits
    /// behind; an empty list means the socket peer address is used as-is.
    pub trusted_proxy_headers: Vec<String>,
    /// Lower bound for `cleanup`: attempts younger than this are never deleted.
    pub attempt_retention_secs: u64,
    pub session_user_key: String,
    pub session_permissions: Vec<String>,
    pub session_rate_ceiling: u32,
    pub max_body_bytes: usize,
}

impl Default for AccessConfig {
    fn default() -> Self {
        let presets = PresetSettings::default();
        AccessConfig {
            database_path: PathBuf::from("access.db"),
            csrf: CsrfSettings::default(),
            session_rate_ceiling: presets.api.max_attempts,
            presets,
            trusted_proxy_headers: vec![
                "cf-connecting-ip".into(),
                "x-forwarded-for".into(),
                "x-real-ip".into(),
            ],
            attempt_retention_secs: 3600,
            session_user_key: "user_id".into(),
            session_permissions: vec!["read".into(), "write".into()],
            max_body_bytes: 1024 * 1024,
        }
    }
}

impl AccessConfig {
    /// Load from a JSON file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: AccessConfig = serde_json::from_str(&data)?;
            Ok(config)
        } else {
            log::info!("No access config at {}, using defaults", path.display());
            Ok(AccessConfig::default())
        }
    }

    /// Load from `HOUSEHOLD_ACCESS_CONFIG` (default `access.json`), then apply
    /// the `HOUSEHOLD_ACCESS_DB` override.
    pub fn from_env() -> Result<Self, ConfigError> {
        let path = std::env::var(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("access.json"));
        let mut config = Self::load(&path)?;
        if let Ok(db) = std::env::var(DATABASE_ENV) {
            config.database_path = PathBuf::from(db);
        }
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let data = serde_json::to_string_pretty(self)?;
        std::fs::write(path, data)?;
        Ok(())
    }

    /// Longest window any preset uses. `cleanup` never deletes inside it.
    pub fn longest_window_secs(&self) -> u64 {
        [
            self.presets.login.window_secs,
            self.presets.api.window_secs,
            self.presets.password_reset.window_secs,
        ]
        .into_iter()
        .max()
        .unwrap_or(0)
        .max(self.attempt_retention_secs)
    }
}
