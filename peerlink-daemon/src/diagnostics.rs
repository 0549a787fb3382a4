//! Command line and logging
//!
//! Command-line flags override the matching settings from `daemon.toml`.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::{fmt, EnvFilter};

/// peerlink daemon
#[derive(Parser, Debug)]
#[command(name = "peerlink-daemon")]
#[command(about = "Announce this host on the LAN and pair with nearby devices", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Configuration file (defaults to the user's config directory)
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON
    #[arg(long)]
    pub json_logs: bool,

    /// Start without listening for or sending announcements
    #[arg(long)]
    pub no_discovery: bool,

    /// Accept every incoming pairing request
    #[arg(long)]
    pub auto_accept: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Print this host's device id and certificate fingerprint
    Fingerprint,

    /// List remembered devices and whether they are paired
    Devices,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

pub fn init_logging(cli: &Cli) -> Result<()> {
    let log_level = cli.log_level.parse::<Level>().with_context(|| {
        format!(
            "Invalid log level '{}'. Valid levels: error, warn, info, debug, trace",
            cli.log_level
        )
    })?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level.as_str()))
        .context("Failed to create log filter")?;

    let subscriber = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false);

    if cli.json_logs {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    info!("Logging initialized: level={}, json={}", log_level, cli.json_logs);

    Ok(())
}
