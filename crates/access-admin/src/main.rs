mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "access-admin")]
#[command(about = "Manage API keys and rate-limit data for the household access layer")]
#[command(version)]
struct Cli {
    /// Access config file (default: $HOUSEHOLD_ACCESS_CONFIG or access.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Database path, overriding the config file
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database schema and optionally write a default config file
    Init {
        /// Also write the effective config to --config (or access.json)
        #[arg(long)]
        write_config: bool,
    },
    /// Provision a new API key and print its secret once
    IssueKey {
        /// Owning user id
        #[arg(long)]
        owner: i64,
        /// Display name (e.g. "Spreadsheet sync")
        #[arg(long)]
        name: String,
        /// Comma-separated scopes
        #[arg(long, default_value = "read")]
        scopes: String,
        /// Requests allowed per calendar hour
        #[arg(long, default_value_t = 100)]
        quota: u32,
        /// Expire the key after this many days
        #[arg(long)]
        expires_in_days: Option<i64>,
    },
    /// List an owner's keys (secrets are never shown)
    ListKeys {
        #[arg(long)]
        owner: i64,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Replace a key with a fresh secret; the old one stops working immediately
    RotateKey { id: String },
    /// Permanently deactivate a key
    RevokeKey { id: String },
    /// Delete old rate-limit attempts and past-hour API key counters
    Cleanup {
        /// Age threshold in seconds (default: the configured retention)
        #[arg(long)]
        older_than: Option<u64>,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let (config, config_path) = commands::load_config(cli.config.as_deref(), cli.db)?;

    match cli.command {
        Commands::Init { write_config } => commands::init(&config, &config_path, write_config),
        Commands::IssueKey {
            owner,
            name,
            scopes,
            quota,
            expires_in_days,
        } => commands::issue_key(config, owner, name, &scopes, quota, expires_in_days),
        Commands::ListKeys { owner, json } => commands::list_keys(config, owner, json),
        Commands::RotateKey { id } => commands::rotate_key(config, &id),
        Commands::RevokeKey { id } => commands::revoke_key(config, &id),
        Commands::Cleanup { older_than } => commands::cleanup(config, older_than),
    }
}
