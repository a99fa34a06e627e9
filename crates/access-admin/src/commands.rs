use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use chrono::{TimeDelta, Utc};
use household_access::config::CONFIG_ENV;
use household_access::{AccessConfig, AccessControl, Database, NewApiKey};

pub fn load_config(
    path: Option<&Path>,
    db_override: Option<PathBuf>,
) -> anyhow::Result<(AccessConfig, PathBuf)> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => std::env::var(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("access.json")),
    };
    let mut config = AccessConfig::load(&path)
        .with_context(|| format!("failed to load config from {}", path.display()))?;
    if let Some(db) = db_override {
        config.database_path = db;
    } else if let Ok(db) = std::env::var(household_access::config::DATABASE_ENV) {
        config.database_path = PathBuf::from(db);
    }
    Ok((config, path))
}

fn open(config: AccessConfig) -> anyhow::Result<AccessControl> {
    let path = config.database_path.clone();
    AccessControl::open(config).with_context(|| format!("failed to open {}", path.display()))
}

pub fn init(config: &AccessConfig, config_path: &Path, write_config: bool) -> anyhow::Result<()> {
    Database::open(&config.database_path)
        .with_context(|| format!("failed to create {}", config.database_path.display()))?;
    println!("Database ready at {}", config.database_path.display());

    if write_config {
        if config_path.exists() {
            bail!("{} already exists, not overwriting", config_path.display());
        }
        config.save(config_path)?;
        println!("Wrote {}", config_path.display());
    }
    Ok(())
}

pub fn issue_key(
    config: AccessConfig,
    owner: i64,
    name: String,
    scopes: &str,
    quota: u32,
    expires_in_days: Option<i64>,
) -> anyhow::Result<()> {
    let scopes: Vec<String> = scopes
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    if scopes.is_empty() {
        bail!("at least one scope is required");
    }
    let expires_at = match expires_in_days {
        Some(days) if days <= 0 => bail!("--expires-in-days must be positive"),
        Some(days) => Some(
            Utc::now()
                + TimeDelta::try_days(days).context("--expires-in-days is out of range")?,
        ),
        None => None,
    };

    let access = open(config)?;
    let (key, secret) = access.authenticator().issue(NewApiKey {
        owner_user_id: owner,
        name,
        scopes,
        hourly_quota: quota,
        expires_at,
    })?;

    println!("Issued key {} ({})", key.id, key.masked_preview());
    println!();
    println!("  {}", secret);
    println!();
    println!("Store this secret now. It cannot be shown again.");
    Ok(())
}

pub fn list_keys(config: AccessConfig, owner: i64, json: bool) -> anyhow::Result<()> {
    let access = open(config)?;
    let keys = access.authenticator().list_for_owner(owner)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&keys)?);
        return Ok(());
    }

    if keys.is_empty() {
        println!("No keys for owner {}", owner);
        return Ok(());
    }

    let now = Utc::now();
    for key in &keys {
        let state = if !key.is_active {
            "revoked"
        } else if key.is_expired(now) {
            "expired"
        } else {
            "active"
        };
        let used = access.authenticator().hourly_usage(&key.id).unwrap_or(0);
        println!(
            "{}  {:<14} {:<8} {}/{} this hour  [{}]  {}",
            key.id,
            key.masked_preview(),
            state,
            used,
            key.hourly_quota,
            key.scopes.iter().cloned().collect::<Vec<_>>().join(","),
            key.name
        );
    }
    Ok(())
}

pub fn rotate_key(config: AccessConfig, id: &str) -> anyhow::Result<()> {
    let access = open(config)?;
    let (key, secret) = access
        .authenticator()
        .rotate(id)
        .with_context(|| format!("cannot rotate {}", id))?;

    println!("Rotated {} -> {} ({})", id, key.id, key.masked_preview());
    println!();
    println!("  {}", secret);
    println!();
    println!("The previous secret no longer authenticates.");
    Ok(())
}

pub fn revoke_key(config: AccessConfig, id: &str) -> anyhow::Result<()> {
    let access = open(config)?;
    if access.authenticator().revoke(id)? {
        println!("Revoked {}", id);
    } else {
        bail!("no active key with id {}", id);
    }
    Ok(())
}

pub fn cleanup(config: AccessConfig, older_than: Option<u64>) -> anyhow::Result<()> {
    let threshold = older_than.unwrap_or(config.attempt_retention_secs);
    let access = open(config)?;
    let deleted = access.rate_limiter().cleanup(threshold)?;
    let windows = access.authenticator().cleanup_hour_windows()?;
    tracing::info!(
        "cleanup removed {} attempt(s) and {} hour window(s)",
        deleted,
        windows
    );
    println!("Removed {} rate-limit attempt(s)", deleted);
    println!("Removed {} expired API key hour window(s)", windows);
    Ok(())
}
