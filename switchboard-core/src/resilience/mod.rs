//! Resilience patterns for connection supervision
//!
//! - Linear backoff between repeated connect attempts
//! - Sliding-window circuit breaker with a fixed cooldown
//! - Single-timer retry scheduling with a network timeout cap
//! - Gateway health scoring

pub mod backoff;
pub mod circuit_breaker;
pub mod health;
pub mod retry;

pub use backoff::{BackoffConfig, LinearBackoff};
pub use circuit_breaker::{BreakerCheck, CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use health::{calculate_health_score, HealthReporter, HealthSnapshot, HealthStatus, QueueTotals};
pub use retry::{PendingRetry, RetryScheduler, RetryState, ScheduleOutcome};
