//! Gateway health reporting
//!
//! Aggregates per-instance connection status and queue totals into a single
//! snapshot with a 0-100 health score. Reporting is read-only: building a
//! snapshot never changes connection or queue state.

use crate::core::connection_fsm::InstanceStatus;
use crate::queue::DeliveryQueue;
use crate::supervisor::{CircuitStatus, ConnectionSupervisor};
use serde::Serialize;

/// Share of the score lost when no instance is active
const INACTIVE_PENALTY: f64 = 40.0;
/// Points lost per instance with an open circuit breaker
const CIRCUIT_OPEN_PENALTY: f64 = 15.0;

/// Coarse health classification derived from the score
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn from_score(score: u8) -> Self {
        match score {
            80..=100 => HealthStatus::Healthy,
            50..=79 => HealthStatus::Degraded,
            _ => HealthStatus::Unhealthy,
        }
    }
}

/// Health score in [0, 100].
///
/// `100 - (1 - active/total) * 40 - circuit_open * 15`, clamped and rounded.
/// No tracked instances scores 100.
pub fn calculate_health_score(total: usize, active: usize, circuit_open: usize) -> u8 {
    if total == 0 {
        return 100;
    }

    let inactive_ratio = 1.0 - (active as f64 / total as f64);
    let score =
        100.0 - inactive_ratio * INACTIVE_PENALTY - circuit_open as f64 * CIRCUIT_OPEN_PENALTY;
    score.clamp(0.0, 100.0).round() as u8
}

/// Message counts summed across every instance queue
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueTotals {
    pub pending: usize,
    pub retrying: usize,
    pub processing: usize,
    pub sent: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub status: HealthStatus,
    pub health_score: u8,
    pub total_instances: usize,
    pub open: usize,
    pub connecting: usize,
    pub circuit_open: usize,
    pub network_stopped: usize,
    pub total_retry_attempts: u64,
    pub total_recent_failures: u64,
    pub queues: QueueTotals,
    pub instances: Vec<CircuitStatus>,
}

impl HealthSnapshot {
    /// Build a snapshot from per-instance statuses
    pub fn from_statuses(instances: Vec<CircuitStatus>, queues: QueueTotals) -> Self {
        let open = count(&instances, |s| s.status == InstanceStatus::Open);
        let connecting = count(&instances, |s| s.status == InstanceStatus::Connecting);
        let circuit_open = count(&instances, |s| s.circuit_open);
        let network_stopped = count(&instances, |s| s.network_stopped);

        let total_retry_attempts = instances.iter().map(|s| u64::from(s.retry_count)).sum();
        let total_recent_failures = instances.iter().map(|s| s.recent_failures as u64).sum();

        let health_score = calculate_health_score(instances.len(), open, circuit_open);

        Self {
            status: HealthStatus::from_score(health_score),
            health_score,
            total_instances: instances.len(),
            open,
            connecting,
            circuit_open,
            network_stopped,
            total_retry_attempts,
            total_recent_failures,
            queues,
            instances,
        }
    }
}

fn count(instances: &[CircuitStatus], pred: impl Fn(&CircuitStatus) -> bool) -> usize {
    instances.iter().filter(|s| pred(s)).count()
}

/// Builds health snapshots from live supervisor and queue state
#[derive(Clone)]
pub struct HealthReporter {
    supervisor: ConnectionSupervisor,
    queue: DeliveryQueue,
}

impl HealthReporter {
    pub fn new(supervisor: ConnectionSupervisor, queue: DeliveryQueue) -> Self {
        Self { supervisor, queue }
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        let mut instances = self.supervisor.circuit_statuses();
        instances.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));

        let snapshot = HealthSnapshot::from_statuses(instances, self.queue.totals());
        self.supervisor
            .metrics()
            .health_score
            .set(i64::from(snapshot.health_score));
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::InstanceId;

    fn status(id: &str, status: InstanceStatus, circuit_open: bool) -> CircuitStatus {
        CircuitStatus {
            instance_id: InstanceId::from(id),
            status,
            retry_count: 2,
            recent_failures: 3,
            circuit_open,
            connected: status == InstanceStatus::Open,
            connecting: status == InstanceStatus::Connecting,
            network_timeout_streak: 0,
            network_stopped: false,
            conflict_cooldown_secs: None,
            pending_retry_secs: None,
        }
    }

    #[test]
    fn test_empty_gateway_is_healthy() {
        assert_eq!(calculate_health_score(0, 0, 0), 100);
    }

    #[test]
    fn test_score_formula() {
        assert_eq!(calculate_health_score(4, 4, 0), 100);
        assert_eq!(calculate_health_score(4, 2, 0), 80);
        assert_eq!(calculate_health_score(4, 0, 0), 60);
        assert_eq!(calculate_health_score(4, 2, 1), 65);
        assert_eq!(calculate_health_score(3, 1, 0), 73);
    }

    #[test]
    fn test_score_clamps_at_zero() {
        assert_eq!(calculate_health_score(10, 0, 10), 0);
    }

    #[test]
    fn test_snapshot_counts() {
        let snapshot = HealthSnapshot::from_statuses(
            vec![
                status("a", InstanceStatus::Open, false),
                status("b", InstanceStatus::Connecting, false),
                status("c", InstanceStatus::CircuitOpen, true),
            ],
            QueueTotals::default(),
        );

        assert_eq!(snapshot.total_instances, 3);
        assert_eq!(snapshot.open, 1);
        assert_eq!(snapshot.connecting, 1);
        assert_eq!(snapshot.circuit_open, 1);
        assert_eq!(snapshot.total_retry_attempts, 6);
        assert_eq!(snapshot.total_recent_failures, 9);
        // 100 - (2/3)*40 - 15 = 58.33
        assert_eq!(snapshot.health_score, 58);
        assert_eq!(snapshot.status, HealthStatus::Degraded);
    }

    #[test]
    fn test_status_bands() {
        assert_eq!(HealthStatus::from_score(100), HealthStatus::Healthy);
        assert_eq!(HealthStatus::from_score(80), HealthStatus::Healthy);
        assert_eq!(HealthStatus::from_score(79), HealthStatus::Degraded);
        assert_eq!(HealthStatus::from_score(49), HealthStatus::Unhealthy);
    }
}
