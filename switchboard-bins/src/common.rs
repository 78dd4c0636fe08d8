//! Common utilities for the binaries
//!
//! Shared initialization, CLI parsing, and shutdown wiring.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use switchboard_core::utils::init_logger;
use switchboard_core::Config;
use tokio::sync::watch;

/// Common CLI arguments
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct CommonArgs {
    /// Configuration file (TOML). Defaults to config/default.toml when present.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log level, overrides the config file
    #[arg(short, long)]
    pub log_level: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    pub json_logs: bool,

    /// Disable the metrics and health HTTP server
    #[arg(long)]
    pub no_metrics: bool,

    /// Instances to connect at startup, in addition to those with stored sessions
    #[arg(long = "connect", value_name = "INSTANCE")]
    pub connect: Vec<String>,
}

/// Load config from `--config`, the default path, or built-in defaults,
/// then apply CLI overrides
pub fn load_config(args: &CommonArgs) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None if PathBuf::from("config/default.toml").exists() => Config::load_default()?,
        None => Config::from_toml_str("")?,
    };

    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }
    if args.json_logs {
        config.logging.json = true;
    }
    if args.no_metrics {
        config.monitoring.enable_metrics = false;
    }

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

pub fn init_logging(config: &Config) -> Result<()> {
    init_logger(&config.logging.level, config.logging.json)
}

/// Shutdown flag flipped by Ctrl+C
pub fn install_shutdown_handler() -> Result<(watch::Sender<bool>, watch::Receiver<bool>)> {
    let (tx, rx) = watch::channel(false);
    let signal_tx = tx.clone();
    ctrlc::set_handler(move || {
        tracing::info!("Shutdown signal received");
        signal_tx.send_replace(true);
    })
    .context("Failed to install Ctrl+C handler")?;
    Ok((tx, rx))
}
