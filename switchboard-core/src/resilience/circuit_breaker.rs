//! Sliding-window circuit breaker for connection attempts
//!
//! Counts failures inside a rolling window. When the count reaches the
//! threshold the breaker trips and refuses attempts for a fixed cooldown,
//! after which it resets itself and clears the failure history.
//!
//! There is no half-open probing: once the cooldown elapses the next
//! attempt goes through as if nothing had happened. Tripping again while
//! already open does not extend the cooldown.
//!
//! The breaker is owned by a single instance's state and is only touched
//! under that instance's lock, so it is plain data. Callers pass `now` in,
//! which keeps it deterministic under paused tokio time.

use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Attempts pass through
    Closed,
    /// Attempts are refused until the cooldown elapses
    Open,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Failures inside the window that trip the breaker
    pub failure_threshold: usize,
    /// Rolling window for counting failures
    pub failure_window: Duration,
    /// How long the breaker stays open once tripped
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 15,
            failure_window: Duration::from_secs(5 * 60),
            cooldown: Duration::from_secs(10 * 60),
        }
    }
}

/// Result of checking the breaker before an attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerCheck {
    Closed,
    Open { remaining: Duration },
    /// Cooldown just elapsed; history was cleared by this check
    Reset,
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    failures: VecDeque<Instant>,
    tripped_at: Option<Instant>,
    trip_count: u64,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            failures: VecDeque::new(),
            tripped_at: None,
            trip_count: 0,
        }
    }

    /// Record a failed attempt. Returns true if this failure tripped the breaker.
    pub fn record_failure(&mut self, now: Instant) -> bool {
        self.prune(now);
        self.failures.push_back(now);

        if self.tripped_at.is_none() && self.failures.len() >= self.config.failure_threshold {
            self.trip(now);
            return true;
        }
        false
    }

    /// Check the breaker, resetting it if the cooldown has elapsed
    pub fn poll(&mut self, now: Instant) -> BreakerCheck {
        self.prune(now);

        if let Some(tripped_at) = self.tripped_at {
            let elapsed = now.saturating_duration_since(tripped_at);
            if elapsed >= self.config.cooldown {
                info!("Circuit breaker cooldown elapsed, resetting");
                self.reset();
                return BreakerCheck::Reset;
            }
            return BreakerCheck::Open {
                remaining: self.config.cooldown - elapsed,
            };
        }

        if self.failures.len() >= self.config.failure_threshold {
            self.trip(now);
            return BreakerCheck::Open {
                remaining: self.config.cooldown,
            };
        }

        BreakerCheck::Closed
    }

    pub fn is_circuit_open(&mut self, now: Instant) -> bool {
        matches!(self.poll(now), BreakerCheck::Open { .. })
    }

    /// State as of the last mutation, without applying the cooldown
    pub fn state(&self) -> CircuitState {
        if self.tripped_at.is_some() {
            CircuitState::Open
        } else {
            CircuitState::Closed
        }
    }

    /// Failures still inside the window
    pub fn recent_failures(&mut self, now: Instant) -> usize {
        self.prune(now);
        self.failures.len()
    }

    /// Read-only variant of [`is_circuit_open`](Self::is_circuit_open) for reporting.
    /// Never resets the breaker.
    pub fn is_open_at(&self, now: Instant) -> bool {
        match self.tripped_at {
            Some(tripped_at) => now.saturating_duration_since(tripped_at) < self.config.cooldown,
            None => self.failures_in_window(now) >= self.config.failure_threshold,
        }
    }

    /// Failures inside the window as of `now`, without pruning
    pub fn failures_in_window(&self, now: Instant) -> usize {
        self.failures
            .iter()
            .filter(|&&t| now.saturating_duration_since(t) < self.config.failure_window)
            .count()
    }

    /// Times this breaker has tripped since creation
    pub fn trip_count(&self) -> u64 {
        self.trip_count
    }

    /// Close the breaker and forget all failures
    pub fn reset(&mut self) {
        self.failures.clear();
        self.tripped_at = None;
    }

    fn trip(&mut self, now: Instant) {
        warn!(
            failures = self.failures.len(),
            cooldown_secs = self.config.cooldown.as_secs(),
            "Circuit breaker TRIPPED"
        );
        self.tripped_at = Some(now);
        self.trip_count += 1;
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&oldest) = self.failures.front() {
            if now.saturating_duration_since(oldest) >= self.config.failure_window {
                self.failures.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: usize) -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: threshold,
            failure_window: Duration::from_secs(300),
            cooldown: Duration::from_secs(600),
        })
    }

    #[test]
    fn test_starts_closed() {
        let mut cb = breaker(3);
        assert_eq!(cb.poll(Instant::now()), BreakerCheck::Closed);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_trips_at_threshold() {
        let mut cb = breaker(3);
        let now = Instant::now();

        assert!(!cb.record_failure(now));
        assert!(!cb.record_failure(now));
        assert!(cb.record_failure(now));
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.is_circuit_open(now));
        assert_eq!(cb.trip_count(), 1);
    }

    #[test]
    fn test_old_failures_leave_window() {
        let mut cb = breaker(3);
        let start = Instant::now();

        cb.record_failure(start);
        cb.record_failure(start);
        let later = start + Duration::from_secs(301);
        assert_eq!(cb.recent_failures(later), 0);
        assert!(!cb.record_failure(later));
        assert_eq!(cb.poll(later), BreakerCheck::Closed);
    }

    #[test]
    fn test_stays_open_for_full_cooldown() {
        let mut cb = breaker(2);
        let start = Instant::now();
        cb.record_failure(start);
        cb.record_failure(start);

        // Window has emptied but the cooldown has not
        let check = cb.poll(start + Duration::from_secs(400));
        assert_eq!(
            check,
            BreakerCheck::Open {
                remaining: Duration::from_secs(200)
            }
        );
    }

    #[test]
    fn test_resets_after_cooldown() {
        let mut cb = breaker(2);
        let start = Instant::now();
        cb.record_failure(start);
        cb.record_failure(start);

        let after = start + Duration::from_secs(600);
        assert_eq!(cb.poll(after), BreakerCheck::Reset);
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.recent_failures(after), 0);
        assert_eq!(cb.poll(after), BreakerCheck::Closed);
    }

    #[test]
    fn test_repeated_trip_does_not_extend_cooldown() {
        let mut cb = breaker(2);
        let start = Instant::now();
        cb.record_failure(start);
        cb.record_failure(start);

        let mid = start + Duration::from_secs(300);
        assert!(!cb.record_failure(mid));
        assert!(!cb.record_failure(mid));
        assert_eq!(cb.trip_count(), 1);

        assert_eq!(
            cb.poll(start + Duration::from_secs(600)),
            BreakerCheck::Reset
        );
    }

    #[test]
    fn test_read_only_queries_do_not_reset() {
        let mut cb = breaker(1);
        let start = Instant::now();
        cb.record_failure(start);

        let after = start + Duration::from_secs(700);
        assert!(!cb.is_open_at(after));
        assert_eq!(cb.failures_in_window(after), 0);
        // Still tripped until a poll applies the cooldown
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.poll(after), BreakerCheck::Reset);
    }

    #[test]
    fn test_manual_reset() {
        let mut cb = breaker(1);
        let now = Instant::now();
        cb.record_failure(now);
        assert!(cb.is_circuit_open(now));

        cb.reset();
        assert!(!cb.is_circuit_open(now));
    }
}
