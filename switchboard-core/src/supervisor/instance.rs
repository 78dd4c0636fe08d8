//! Per-instance connection state
//!
//! Everything the supervisor knows about one instance lives in a single
//! [`InstanceConnectionState`] behind a mutex. Critical sections are short
//! and never span an `.await`.

use crate::config::SupervisorConfig;
use crate::core::connection_fsm::{ConnectionLifecycle, InstanceStatus};
use crate::core::types::InstanceId;
use crate::monitoring::ConnectionMetrics;
use crate::resilience::{CircuitBreaker, RetryScheduler, RetryState};
use crate::transport::{TransportSession, UserInfo};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

/// Generations are unique across all slots, so events from a removed
/// instance can never match an attempt on its replacement
static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

fn next_generation() -> u64 {
    NEXT_GENERATION.fetch_add(1, Ordering::Relaxed)
}

/// Identifies one connection attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionHandle {
    pub instance_id: InstanceId,
    pub generation: u64,
}

/// Point-in-time view of an instance's connection and retry state
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitStatus {
    pub instance_id: InstanceId,
    pub status: InstanceStatus,
    pub retry_count: u32,
    pub recent_failures: usize,
    pub circuit_open: bool,
    pub connected: bool,
    pub connecting: bool,
    pub network_timeout_streak: u32,
    /// Retries stopped after too many consecutive network timeouts
    pub network_stopped: bool,
    pub conflict_cooldown_secs: Option<u64>,
    pub pending_retry_secs: Option<u64>,
}

pub(crate) struct LiveConnection {
    pub(crate) session: Arc<dyn TransportSession>,
    pub(crate) generation: u64,
}

pub(crate) struct InstanceConnectionState {
    pub(crate) instance_id: InstanceId,
    lifecycle: ConnectionLifecycle,
    pub(crate) retry_count: u32,
    pub(crate) breaker: CircuitBreaker,
    pub(crate) retry: RetryState,
    pub(crate) last_conflict: Option<Instant>,
    pub(crate) connection: Option<LiveConnection>,
    /// Replaced on every attempt and on every forced teardown. Events and
    /// timers tagged with any other generation are ignored.
    pub(crate) generation: u64,
    /// Number of teardowns in flight
    pub(crate) cleanup: watch::Sender<u32>,
    pub(crate) status_tx: watch::Sender<InstanceStatus>,
    pub(crate) qr_tx: watch::Sender<Option<String>>,
    pub(crate) qr_issued_at: Option<Instant>,
    pub(crate) user: Option<UserInfo>,
}

impl InstanceConnectionState {
    pub(crate) fn new(
        instance_id: InstanceId,
        config: &SupervisorConfig,
        metrics: &ConnectionMetrics,
        now: Instant,
    ) -> Self {
        metrics
            .instances_by_status
            .with_label_values(&[InstanceStatus::Idle.state_name()])
            .inc();

        Self {
            lifecycle: ConnectionLifecycle::new(instance_id.clone(), now),
            instance_id,
            retry_count: 0,
            breaker: CircuitBreaker::new(config.breaker()),
            retry: RetryState::default(),
            last_conflict: None,
            connection: None,
            generation: 0,
            cleanup: watch::channel(0).0,
            status_tx: watch::channel(InstanceStatus::Idle).0,
            qr_tx: watch::channel(None).0,
            qr_issued_at: None,
            user: None,
        }
    }

    pub(crate) fn status(&self) -> InstanceStatus {
        self.lifecycle.status()
    }

    pub(crate) fn lifecycle(&self) -> &ConnectionLifecycle {
        &self.lifecycle
    }

    /// Apply a transition, keeping the status watch and gauge in sync.
    /// Invalid transitions are ignored.
    pub(crate) fn move_to(
        &mut self,
        next: InstanceStatus,
        now: Instant,
        metrics: &ConnectionMetrics,
    ) -> bool {
        match self.lifecycle.transition(next, now) {
            Ok(previous) => {
                metrics
                    .instances_by_status
                    .with_label_values(&[previous.state_name()])
                    .dec();
                metrics
                    .instances_by_status
                    .with_label_values(&[next.state_name()])
                    .inc();
                self.status_tx.send_replace(next);
                true
            }
            Err(e) => {
                debug!(instance = %self.instance_id, "Skipping state change: {}", e);
                false
            }
        }
    }

    /// Enter Connecting for a new attempt and return its generation
    pub(crate) fn begin_attempt(&mut self, now: Instant, metrics: &ConnectionMetrics) -> u64 {
        self.move_to(InstanceStatus::Connecting, now, metrics);
        self.generation = next_generation();
        self.generation
    }

    /// Orphan the current attempt so its events and timers are ignored
    pub(crate) fn invalidate(&mut self) {
        self.generation = next_generation();
    }

    pub(crate) fn is_current(&self, generation: u64) -> bool {
        self.generation == generation
    }

    pub(crate) fn handle(&self) -> ConnectionHandle {
        ConnectionHandle {
            instance_id: self.instance_id.clone(),
            generation: self.generation,
        }
    }

    pub(crate) fn cleanup_in_progress(&self) -> bool {
        *self.cleanup.borrow() > 0
    }

    pub(crate) fn conflict_cooldown_remaining(
        &self,
        now: Instant,
        window: Duration,
    ) -> Option<Duration> {
        let elapsed = now.saturating_duration_since(self.last_conflict?);
        (elapsed < window).then(|| window - elapsed)
    }

    pub(crate) fn set_qr(&mut self, code: String, now: Instant) {
        if self.qr_issued_at.is_none() {
            self.qr_issued_at = Some(now);
        }
        self.qr_tx.send_replace(Some(code));
    }

    pub(crate) fn clear_qr(&mut self) {
        self.qr_issued_at = None;
        self.qr_tx.send_replace(None);
    }

    /// Clear retry count and failure history
    pub(crate) fn reset_counters(&mut self) {
        self.retry_count = 0;
        self.breaker.reset();
    }

    /// Read-only status view. Does not apply the breaker cooldown.
    pub(crate) fn snapshot(
        &self,
        now: Instant,
        config: &SupervisorConfig,
        scheduler: &RetryScheduler,
    ) -> CircuitStatus {
        let circuit_open = self.breaker.is_open_at(now);
        let status = effective_status(self.status(), circuit_open);

        CircuitStatus {
            instance_id: self.instance_id.clone(),
            status,
            retry_count: self.retry_count,
            recent_failures: self.breaker.failures_in_window(now),
            circuit_open,
            connected: status == InstanceStatus::Open,
            connecting: status == InstanceStatus::Connecting,
            network_timeout_streak: self.retry.network_timeout_streak(),
            network_stopped: scheduler.is_stopped(&self.retry),
            conflict_cooldown_secs: self
                .conflict_cooldown_remaining(now, config.conflict_suppression())
                .map(|d| d.as_secs()),
            pending_retry_secs: self
                .retry
                .pending()
                .map(|p| p.due_at.saturating_duration_since(now).as_secs()),
        }
    }
}

/// An inactive instance whose breaker is open reports as CircuitOpen
pub(crate) fn effective_status(status: InstanceStatus, circuit_open: bool) -> InstanceStatus {
    if circuit_open && !status.is_live() {
        InstanceStatus::CircuitOpen
    } else {
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitoring::MetricsRegistry;

    fn state(metrics: &MetricsRegistry) -> InstanceConnectionState {
        InstanceConnectionState::new(
            InstanceId::from("a"),
            &SupervisorConfig::default(),
            metrics.connection(),
            Instant::now(),
        )
    }

    #[test]
    fn test_transitions_update_gauge_and_watch() {
        let metrics = MetricsRegistry::new().unwrap();
        let mut s = state(&metrics);
        let rx = s.status_tx.subscribe();
        let gauge = |name: &str| {
            metrics
                .connection()
                .instances_by_status
                .with_label_values(&[name])
                .get()
        };

        assert_eq!(gauge("Idle"), 1);
        let generation = s.begin_attempt(Instant::now(), metrics.connection());
        assert!(s.is_current(generation));
        assert_eq!(*rx.borrow(), InstanceStatus::Connecting);
        assert_eq!(gauge("Idle"), 0);
        assert_eq!(gauge("Connecting"), 1);

        // Invalid transition leaves everything alone
        assert!(!s.move_to(InstanceStatus::CircuitOpen, Instant::now(), metrics.connection()));
        assert_eq!(s.status(), InstanceStatus::Connecting);
    }

    #[test]
    fn test_generations_unique_across_slots() {
        let metrics = MetricsRegistry::new().unwrap();
        let mut first = state(&metrics);
        let mut second = state(&metrics);

        let old = first.begin_attempt(Instant::now(), metrics.connection());
        let new = second.begin_attempt(Instant::now(), metrics.connection());
        assert_ne!(old, new);
        assert!(!second.is_current(old));

        first.invalidate();
        assert!(!first.is_current(old));
    }

    #[test]
    fn test_conflict_cooldown_remaining() {
        let metrics = MetricsRegistry::new().unwrap();
        let mut s = state(&metrics);
        let now = Instant::now();
        let window = Duration::from_secs(120);

        assert_eq!(s.conflict_cooldown_remaining(now, window), None);
        s.last_conflict = Some(now);
        assert_eq!(
            s.conflict_cooldown_remaining(now + Duration::from_secs(20), window),
            Some(Duration::from_secs(100))
        );
        assert_eq!(
            s.conflict_cooldown_remaining(now + Duration::from_secs(120), window),
            None
        );
    }

    #[test]
    fn test_qr_issue_time_kept_across_refreshes() {
        let metrics = MetricsRegistry::new().unwrap();
        let mut s = state(&metrics);
        let first = Instant::now();

        s.set_qr("one".to_string(), first);
        s.set_qr("two".to_string(), first + Duration::from_secs(20));
        assert_eq!(s.qr_issued_at, Some(first));
        assert_eq!(s.qr_tx.borrow().as_deref(), Some("two"));

        s.clear_qr();
        assert!(s.qr_issued_at.is_none());
        assert!(s.qr_tx.borrow().is_none());
    }

    #[test]
    fn test_effective_status() {
        assert_eq!(
            effective_status(InstanceStatus::ClosingRetry, true),
            InstanceStatus::CircuitOpen
        );
        assert_eq!(
            effective_status(InstanceStatus::Open, true),
            InstanceStatus::Open
        );
        assert_eq!(
            effective_status(InstanceStatus::Idle, false),
            InstanceStatus::Idle
        );
    }
}
