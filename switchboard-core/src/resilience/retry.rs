//! Deferred reconnection scheduling
//!
//! Each instance has at most one pending retry timer. Scheduling a new one
//! aborts the previous timer, and every timer carries a token so a timer
//! that already fired can tell it has been superseded.
//!
//! Network timeouts are counted separately. After `max_network_timeouts`
//! consecutive timeouts the scheduler stops retrying that instance and logs
//! a terminal diagnostic; only a successful open resets the streak.

use crate::core::types::InstanceId;
use std::future::Future;
use std::time::Duration;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, error, info};

/// Timer waiting to fire a reconnection attempt
#[derive(Debug)]
pub struct PendingRetry {
    pub token: u64,
    pub reason: String,
    pub due_at: Instant,
    handle: AbortHandle,
}

/// Per-instance retry bookkeeping, stored with the instance's state
#[derive(Debug, Default)]
pub struct RetryState {
    network_timeout_streak: u32,
    pending: Option<PendingRetry>,
    next_token: u64,
}

impl RetryState {
    pub fn network_timeout_streak(&self) -> u32 {
        self.network_timeout_streak
    }

    pub fn pending(&self) -> Option<&PendingRetry> {
        self.pending.as_ref()
    }

    /// Abort the pending timer, if any. Returns true if one was cancelled.
    pub fn cancel_pending(&mut self) -> bool {
        match self.pending.take() {
            Some(pending) => {
                pending.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Claim the pending slot for a timer that just fired.
    ///
    /// Returns false if the timer was superseded by a newer one.
    pub fn take_if_current(&mut self, token: u64) -> bool {
        match &self.pending {
            Some(pending) if pending.token == token => {
                self.pending = None;
                true
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleOutcome {
    Scheduled { token: u64, replaced: bool },
    /// Network timeout streak hit the limit; nothing was scheduled
    Stopped { streak: u32 },
}

#[derive(Debug, Clone)]
pub struct RetryScheduler {
    max_network_timeouts: u32,
}

impl RetryScheduler {
    pub fn new(max_network_timeouts: u32) -> Self {
        Self {
            max_network_timeouts,
        }
    }

    pub fn max_network_timeouts(&self) -> u32 {
        self.max_network_timeouts
    }

    /// True once the streak has reached the limit
    pub fn is_stopped(&self, state: &RetryState) -> bool {
        state.network_timeout_streak >= self.max_network_timeouts
    }

    /// Arm a retry timer for `instance_id`.
    ///
    /// `fire` receives the timer's token and runs after `delay`. It should
    /// call [`RetryState::take_if_current`] before doing any work.
    pub fn schedule<F, Fut>(
        &self,
        state: &mut RetryState,
        instance_id: &InstanceId,
        delay: Duration,
        reason: &str,
        is_network_timeout: bool,
        fire: F,
    ) -> ScheduleOutcome
    where
        F: FnOnce(u64) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if is_network_timeout {
            state.network_timeout_streak += 1;
            if state.network_timeout_streak >= self.max_network_timeouts {
                state.cancel_pending();
                error!(
                    instance = %instance_id,
                    streak = state.network_timeout_streak,
                    "Too many consecutive network timeouts, stopping retries. \
                     Check network connectivity, firewall rules and DNS, then force a retry"
                );
                return ScheduleOutcome::Stopped {
                    streak: state.network_timeout_streak,
                };
            }
        }

        let replaced = state.cancel_pending();
        if replaced {
            debug!(instance = %instance_id, "Cancelled previous retry timer");
        }

        state.next_token += 1;
        let token = state.next_token;

        info!(
            instance = %instance_id,
            delay_secs = delay.as_secs_f64(),
            reason,
            "Scheduling retry"
        );

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            fire(token).await;
        });

        state.pending = Some(PendingRetry {
            token,
            reason: reason.to_string(),
            due_at: Instant::now() + delay,
            handle: handle.abort_handle(),
        });

        ScheduleOutcome::Scheduled { token, replaced }
    }

    /// Clear the network timeout streak after a successful open
    pub fn reset_network_timeout_counter(&self, state: &mut RetryState, instance_id: &InstanceId) {
        if state.network_timeout_streak > 0 {
            debug!(
                instance = %instance_id,
                streak = state.network_timeout_streak,
                "Resetting network timeout counter"
            );
        }
        state.network_timeout_streak = 0;
    }
}

impl Default for RetryScheduler {
    fn default() -> Self {
        Self::new(5)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn counter_fire(counter: &Arc<AtomicU32>) -> impl FnOnce(u64) -> std::future::Ready<()> {
        let counter = counter.clone();
        move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            std::future::ready(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_fires_after_delay() {
        let scheduler = RetryScheduler::default();
        let mut state = RetryState::default();
        let id = InstanceId::from("a");
        let fired = Arc::new(AtomicU32::new(0));

        let outcome = scheduler.schedule(
            &mut state,
            &id,
            Duration::from_secs(15),
            "transient",
            false,
            counter_fire(&fired),
        );
        assert!(matches!(
            outcome,
            ScheduleOutcome::Scheduled { replaced: false, .. }
        ));

        tokio::time::sleep(Duration::from_secs(14)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_schedule_replaces_pending() {
        let scheduler = RetryScheduler::default();
        let mut state = RetryState::default();
        let id = InstanceId::from("a");
        let fired = Arc::new(AtomicU32::new(0));

        scheduler.schedule(&mut state, &id, Duration::from_secs(10), "first", false, counter_fire(&fired));
        let outcome = scheduler.schedule(
            &mut state,
            &id,
            Duration::from_secs(10),
            "second",
            false,
            counter_fire(&fired),
        );
        assert!(matches!(
            outcome,
            ScheduleOutcome::Scheduled { replaced: true, .. }
        ));
        assert_eq!(state.pending().map(|p| p.reason.as_str()), Some("second"));

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_after_max_network_timeouts() {
        let scheduler = RetryScheduler::new(5);
        let mut state = RetryState::default();
        let id = InstanceId::from("a");
        let fired = Arc::new(AtomicU32::new(0));

        for _ in 0..4 {
            let outcome =
                scheduler.schedule(&mut state, &id, Duration::from_secs(30), "timeout", true, counter_fire(&fired));
            assert!(matches!(outcome, ScheduleOutcome::Scheduled { .. }));
        }

        let outcome =
            scheduler.schedule(&mut state, &id, Duration::from_secs(30), "timeout", true, counter_fire(&fired));
        assert_eq!(outcome, ScheduleOutcome::Stopped { streak: 5 });
        assert!(state.pending().is_none());
        assert!(scheduler.is_stopped(&state));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_failures_do_not_touch_streak() {
        let scheduler = RetryScheduler::new(2);
        let mut state = RetryState::default();
        let id = InstanceId::from("a");
        let fired = Arc::new(AtomicU32::new(0));

        scheduler.schedule(&mut state, &id, Duration::from_secs(1), "timeout", true, counter_fire(&fired));
        for _ in 0..5 {
            scheduler.schedule(&mut state, &id, Duration::from_secs(1), "transient", false, counter_fire(&fired));
        }
        assert_eq!(state.network_timeout_streak(), 1);
        assert!(!scheduler.is_stopped(&state));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_counter() {
        let scheduler = RetryScheduler::new(5);
        let mut state = RetryState::default();
        let id = InstanceId::from("a");
        let fired = Arc::new(AtomicU32::new(0));

        for _ in 0..3 {
            scheduler.schedule(&mut state, &id, Duration::from_secs(1), "timeout", true, counter_fire(&fired));
        }
        scheduler.reset_network_timeout_counter(&mut state, &id);
        assert_eq!(state.network_timeout_streak(), 0);
    }

    #[test]
    fn test_take_if_current_rejects_stale_token() {
        let mut state = RetryState::default();
        assert!(!state.take_if_current(1));
        assert!(!state.cancel_pending());
    }
}
