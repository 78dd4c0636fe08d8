pub mod types;

pub use types::*;

use anyhow::{Context, Result};
use config::{Config as ConfigLoader, ConfigBuilder, Environment, File, FileFormat};
use config::builder::DefaultState;
use std::path::Path;

impl Config {
    /// Load configuration from file with environment variable overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config_path = path.as_ref();

        let builder = Self::builder_with_defaults()?.add_source(File::from(config_path));
        Self::finish(builder)
            .with_context(|| format!("Failed to load configuration from {}", config_path.display()))
    }

    /// Load from default location (./config/default.toml)
    pub fn load_default() -> Result<Self> {
        Self::load("config/default.toml")
    }

    /// Parse a TOML document, still applying environment overrides
    pub fn from_toml_str(toml: &str) -> Result<Self> {
        let builder =
            Self::builder_with_defaults()?.add_source(File::from_str(toml, FileFormat::Toml));
        Self::finish(builder)
    }

    fn builder_with_defaults() -> Result<ConfigBuilder<DefaultState>> {
        Ok(ConfigLoader::builder()
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            .set_default("monitoring.enable_metrics", true)?
            .set_default("monitoring.metrics_addr", "127.0.0.1:9090")?
            .set_default("monitoring.metrics_path", "/metrics")?
            .set_default("storage.sessions_dir", "./data/sessions")?)
    }

    fn finish(builder: ConfigBuilder<DefaultState>) -> Result<Self> {
        let config = builder
            // Override with environment variables (SWITCHBOARD__QUEUE__MAX_QUEUE_SIZE=50)
            .add_source(
                Environment::with_prefix("SWITCHBOARD")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?;

        let cfg: Config = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let s = &self.supervisor;

        if s.failure_threshold == 0 {
            anyhow::bail!("supervisor.failure_threshold must be at least 1");
        }

        if s.failure_window_secs == 0 || s.breaker_cooldown_secs == 0 {
            anyhow::bail!("supervisor failure window and breaker cooldown must be positive");
        }

        if s.backoff_step_secs > s.backoff_max_secs {
            anyhow::bail!(
                "supervisor.backoff_step_secs ({}) cannot exceed backoff_max_secs ({})",
                s.backoff_step_secs,
                s.backoff_max_secs
            );
        }

        if s.max_network_timeouts == 0 {
            anyhow::bail!("supervisor.max_network_timeouts must be at least 1");
        }

        if s.qr_wait_timeout_secs == 0 || s.sweep_interval_secs == 0 {
            anyhow::bail!("supervisor.qr_wait_timeout_secs and sweep_interval_secs must be positive");
        }

        let q = &self.queue;

        // Messages for one instance are delivered strictly one at a time
        if q.batch_size != 1 {
            anyhow::bail!("queue.batch_size must be 1, got {}", q.batch_size);
        }

        if q.max_queue_size == 0 {
            anyhow::bail!("queue.max_queue_size must be positive");
        }

        if q.max_retries == 0 {
            anyhow::bail!("queue.max_retries must be at least 1");
        }

        if q.send_timeout_secs == 0 || q.drain_interval_ms == 0 {
            anyhow::bail!("queue.send_timeout_secs and drain_interval_ms must be positive");
        }

        if !self.monitoring.metrics_path.starts_with('/') {
            anyhow::bail!(
                "monitoring.metrics_path must start with '/', got '{}'",
                self.monitoring.metrics_path
            );
        }

        if !(0.0..=1.0).contains(&self.simulation.send_failure_rate) {
            anyhow::bail!("simulation.send_failure_rate must be between 0.0 and 1.0");
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.as_str()) {
            anyhow::bail!(
                "Invalid log level '{}', must be one of: {:?}",
                self.logging.level,
                valid_log_levels
            );
        }

        let mut tokens = std::collections::HashSet::new();
        for tenant in &self.tenants {
            if tenant.token.is_empty() {
                anyhow::bail!("tenant '{}' has an empty token", tenant.id);
            }
            if !tokens.insert(tenant.token.as_str()) {
                anyhow::bail!("tenant '{}' reuses another tenant's token", tenant.id);
            }
        }

        Ok(())
    }
}
