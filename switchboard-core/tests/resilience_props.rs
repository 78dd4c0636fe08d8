//! Property-based tests for backoff, the failure window and health scoring

use proptest::prelude::*;
use std::time::Duration;
use switchboard_core::resilience::{
    calculate_health_score, BackoffConfig, CircuitBreaker, CircuitBreakerConfig, LinearBackoff,
};
use tokio::time::Instant;

// ===== BACKOFF =====

/// Property: delay is min(retries * step, max)
#[test]
fn prop_backoff_is_linear_then_capped() {
    let backoff = LinearBackoff::new(BackoffConfig::default());
    proptest!(|(retries in 0u32..10_000)| {
        let expected = Duration::from_secs((u64::from(retries) * 5).min(60));
        prop_assert_eq!(backoff.compute_backoff_delay(retries), expected);
    });
}

/// Property: more retries never means a shorter wait
#[test]
fn prop_backoff_monotonic() {
    let backoff = LinearBackoff::new(BackoffConfig::default());
    proptest!(|(a in 0u32..1_000, b in 0u32..1_000)| {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        prop_assert!(backoff.compute_backoff_delay(lo) <= backoff.compute_backoff_delay(hi));
    });
}

/// Property: no wait until the instance has retried more than five times
#[test]
fn prop_backoff_only_after_threshold() {
    let backoff = LinearBackoff::new(BackoffConfig::default());
    proptest!(|(retries in 0u32..100)| {
        prop_assert_eq!(backoff.delay_before_attempt(retries).is_some(), retries > 5);
    });
}

/// Property: huge retry counts saturate instead of overflowing
#[test]
fn prop_backoff_never_overflows() {
    let backoff = LinearBackoff::new(BackoffConfig::default());
    proptest!(|(retries in any::<u32>())| {
        prop_assert!(backoff.compute_backoff_delay(retries) <= Duration::from_secs(60));
    });
}

// ===== FAILURE WINDOW =====

/// Property: the breaker opens exactly when the window reaches the threshold
#[test]
fn prop_breaker_trips_at_threshold() {
    proptest!(|(threshold in 1usize..30, failures in 0usize..40)| {
        let config = CircuitBreakerConfig {
            failure_threshold: threshold,
            ..CircuitBreakerConfig::default()
        };
        let mut breaker = CircuitBreaker::new(config);
        let now = Instant::now();

        for _ in 0..failures {
            breaker.record_failure(now);
        }
        prop_assert_eq!(breaker.is_open_at(now), failures >= threshold);
        prop_assert_eq!(breaker.trip_count(), u64::from(failures >= threshold));
    });
}

/// Property: failures spread wider than the window never trip the breaker
#[test]
fn prop_spread_failures_age_out() {
    proptest!(|(failures in 1usize..100)| {
        // At most 14 failures fit in a 300s window
        let spacing = Duration::from_secs(22);
        let mut breaker = CircuitBreaker::new(CircuitBreakerConfig::default());
        let start = Instant::now();

        for i in 0..failures {
            breaker.record_failure(start + spacing * i as u32);
        }
        let last = start + spacing * (failures as u32 - 1);
        prop_assert!(breaker.failures_in_window(last) < 15);
        prop_assert!(!breaker.is_open_at(last));
    });
}

// ===== HEALTH SCORE =====

/// Property: score stays within 0..=100
#[test]
fn prop_health_score_bounded() {
    proptest!(|(total in 0usize..500, active_pct in 0usize..=100, open in 0usize..50)| {
        let active = total * active_pct / 100;
        let score = calculate_health_score(total, active, open);
        prop_assert!(score <= 100);
    });
}

/// Property: more active instances never lowers the score
#[test]
fn prop_health_score_monotonic_in_active() {
    proptest!(|(total in 1usize..200, a in 0usize..200, b in 0usize..200, open in 0usize..5)| {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        let lo = lo.min(total);
        let hi = hi.min(total);
        prop_assert!(
            calculate_health_score(total, lo, open) <= calculate_health_score(total, hi, open)
        );
    });
}
