use crate::resilience::{BackoffConfig, CircuitBreakerConfig};
use crate::transport::SimulationConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub supervisor: SupervisorConfig,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub monitoring: MonitoringConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    /// Settings for the in-process transport used by the daemon
    #[serde(default)]
    pub simulation: SimulationConfig,

    #[serde(default)]
    pub tenants: Vec<TenantConfig>,
}

/// Connection supervision tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Failures inside the window that trip the circuit breaker
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: usize,

    #[serde(default = "default_failure_window_secs")]
    pub failure_window_secs: u64,

    /// How long a tripped breaker refuses connects
    #[serde(default = "default_breaker_cooldown_secs")]
    pub breaker_cooldown_secs: u64,

    #[serde(default = "default_backoff_step_secs")]
    pub backoff_step_secs: u64,

    #[serde(default = "default_backoff_max_secs")]
    pub backoff_max_secs: u64,

    /// Connect attempts allowed before backoff delays apply
    #[serde(default = "default_backoff_after_retries")]
    pub backoff_after_retries: u32,

    /// Connects are refused for this long after a conflict
    #[serde(default = "default_conflict_suppression_secs")]
    pub conflict_suppression_secs: u64,

    #[serde(default = "default_conflict_retry_delay_secs")]
    pub conflict_retry_delay_secs: u64,

    /// Pause after tearing down a conflicted connection
    #[serde(default = "default_conflict_settle_ms")]
    pub conflict_settle_ms: u64,

    /// Pause after tearing down a previous connection before reconnecting
    #[serde(default = "default_cleanup_settle_ms")]
    pub cleanup_settle_ms: u64,

    /// Consecutive network timeouts before retries stop
    #[serde(default = "default_max_network_timeouts")]
    pub max_network_timeouts: u32,

    #[serde(default = "default_timeout_retry_delay_secs")]
    pub timeout_retry_delay_secs: u64,

    #[serde(default = "default_transient_retry_delay_secs")]
    pub transient_retry_delay_secs: u64,

    #[serde(default = "default_qr_wait_timeout_secs")]
    pub qr_wait_timeout_secs: u64,

    /// Unpaired instances are logged out after holding a code this long
    #[serde(default = "default_qr_session_ttl_secs")]
    pub qr_session_ttl_secs: u64,

    /// Connecting longer than this is treated as stuck by the sweep
    #[serde(default = "default_stale_connecting_secs")]
    pub stale_connecting_secs: u64,

    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_failure_threshold() -> usize {
    15
}

fn default_failure_window_secs() -> u64 {
    300
}

fn default_breaker_cooldown_secs() -> u64 {
    600
}

fn default_backoff_step_secs() -> u64 {
    5
}

fn default_backoff_max_secs() -> u64 {
    60
}

fn default_backoff_after_retries() -> u32 {
    5
}

fn default_conflict_suppression_secs() -> u64 {
    120
}

fn default_conflict_retry_delay_secs() -> u64 {
    90
}

fn default_conflict_settle_ms() -> u64 {
    5_000
}

fn default_cleanup_settle_ms() -> u64 {
    3_000
}

fn default_max_network_timeouts() -> u32 {
    5
}

fn default_timeout_retry_delay_secs() -> u64 {
    30
}

fn default_transient_retry_delay_secs() -> u64 {
    15
}

fn default_qr_wait_timeout_secs() -> u64 {
    60
}

fn default_qr_session_ttl_secs() -> u64 {
    300
}

fn default_stale_connecting_secs() -> u64 {
    300
}

fn default_sweep_interval_secs() -> u64 {
    600
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            failure_window_secs: default_failure_window_secs(),
            breaker_cooldown_secs: default_breaker_cooldown_secs(),
            backoff_step_secs: default_backoff_step_secs(),
            backoff_max_secs: default_backoff_max_secs(),
            backoff_after_retries: default_backoff_after_retries(),
            conflict_suppression_secs: default_conflict_suppression_secs(),
            conflict_retry_delay_secs: default_conflict_retry_delay_secs(),
            conflict_settle_ms: default_conflict_settle_ms(),
            cleanup_settle_ms: default_cleanup_settle_ms(),
            max_network_timeouts: default_max_network_timeouts(),
            timeout_retry_delay_secs: default_timeout_retry_delay_secs(),
            transient_retry_delay_secs: default_transient_retry_delay_secs(),
            qr_wait_timeout_secs: default_qr_wait_timeout_secs(),
            qr_session_ttl_secs: default_qr_session_ttl_secs(),
            stale_connecting_secs: default_stale_connecting_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl SupervisorConfig {
    pub fn breaker(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            failure_window: Duration::from_secs(self.failure_window_secs),
            cooldown: Duration::from_secs(self.breaker_cooldown_secs),
        }
    }

    pub fn backoff(&self) -> BackoffConfig {
        BackoffConfig {
            step: Duration::from_secs(self.backoff_step_secs),
            max_delay: Duration::from_secs(self.backoff_max_secs),
            apply_after_retries: self.backoff_after_retries,
        }
    }

    pub fn conflict_suppression(&self) -> Duration {
        Duration::from_secs(self.conflict_suppression_secs)
    }

    pub fn conflict_retry_delay(&self) -> Duration {
        Duration::from_secs(self.conflict_retry_delay_secs)
    }

    pub fn conflict_settle(&self) -> Duration {
        Duration::from_millis(self.conflict_settle_ms)
    }

    pub fn cleanup_settle(&self) -> Duration {
        Duration::from_millis(self.cleanup_settle_ms)
    }

    pub fn timeout_retry_delay(&self) -> Duration {
        Duration::from_secs(self.timeout_retry_delay_secs)
    }

    pub fn transient_retry_delay(&self) -> Duration {
        Duration::from_secs(self.transient_retry_delay_secs)
    }

    pub fn qr_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.qr_wait_timeout_secs)
    }

    pub fn qr_session_ttl(&self) -> Duration {
        Duration::from_secs(self.qr_session_ttl_secs)
    }

    pub fn stale_connecting(&self) -> Duration {
        Duration::from_secs(self.stale_connecting_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Delivery queue tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Send attempts before a message is marked failed
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,

    /// Capacity of each instance's main queue
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,

    #[serde(default = "default_send_timeout_secs")]
    pub send_timeout_secs: u64,

    #[serde(default = "default_drain_interval_ms")]
    pub drain_interval_ms: u64,

    /// Messages per drain tick. Must be 1.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_secs() -> u64 {
    5
}

fn default_max_queue_size() -> usize {
    100
}

fn default_send_timeout_secs() -> u64 {
    30
}

fn default_drain_interval_ms() -> u64 {
    2_000
}

fn default_batch_size() -> usize {
    1
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_delay_secs: default_retry_delay_secs(),
            max_queue_size: default_max_queue_size(),
            send_timeout_secs: default_send_timeout_secs(),
            drain_interval_ms: default_drain_interval_ms(),
            batch_size: default_batch_size(),
        }
    }
}

impl QueueConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }

    pub fn drain_interval(&self) -> Duration {
        Duration::from_millis(self.drain_interval_ms)
    }
}

/// Monitoring configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringConfig {
    #[serde(default = "default_enable_metrics")]
    pub enable_metrics: bool,

    #[serde(default = "default_metrics_addr")]
    pub metrics_addr: String,

    #[serde(default = "default_metrics_path")]
    pub metrics_path: String,
}

fn default_enable_metrics() -> bool {
    true
}

fn default_metrics_addr() -> String {
    "127.0.0.1:9090".to_string()
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enable_metrics: default_enable_metrics(),
            metrics_addr: default_metrics_addr(),
            metrics_path: default_metrics_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root directory for persisted sessions
    #[serde(default = "default_sessions_dir")]
    pub sessions_dir: PathBuf,
}

fn default_sessions_dir() -> PathBuf {
    PathBuf::from("./data/sessions")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            sessions_dir: default_sessions_dir(),
        }
    }
}

/// A tenant served by the static directory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantConfig {
    pub id: String,

    #[serde(default)]
    pub name: Option<String>,

    /// Access token presented by the tenant's API clients
    pub token: String,

    #[serde(default)]
    pub instances: Vec<String>,

    /// Messages allowed per month; unlimited when absent
    #[serde(default)]
    pub monthly_limit: Option<u64>,
}
