//! Queue statistics and operator hints

use crate::core::types::InstanceId;
use serde::Serialize;
use std::fmt;

/// Success rate (percent) below which sending should slow down
const LOW_SUCCESS_RATE: u8 = 70;
const HIGH_BACKLOG: usize = 10;
const HIGH_RETRY_BACKLOG: usize = 5;

/// Cumulative counters for one instance's queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Messages accepted by enqueue
    pub queued: u64,
    pub sent: u64,
    /// Messages that exhausted their attempts
    pub failed: u64,
    /// Failed attempts moved to the retry queue
    pub retried: u64,
}

impl QueueStats {
    /// Share of finished messages that were sent, in percent.
    ///
    /// `None` until at least one message has finished.
    pub fn success_rate(&self) -> Option<f64> {
        let finished = self.sent + self.failed;
        if finished == 0 {
            return None;
        }
        Some(self.sent as f64 / finished as f64 * 100.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueRecommendation {
    LowSuccessRate,
    HighBacklog,
    RetryBacklog,
    Processing,
    Healthy,
}

impl fmt::Display for QueueRecommendation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            QueueRecommendation::LowSuccessRate => {
                "Low success rate detected. Consider reducing message sending frequency."
            }
            QueueRecommendation::HighBacklog => {
                "High queue backlog. Messages may experience delays."
            }
            QueueRecommendation::RetryBacklog => {
                "Many messages in retry queue. Check connection stability."
            }
            QueueRecommendation::Processing => "Queue is actively processing messages.",
            QueueRecommendation::Healthy => "Queue is healthy and operating normally.",
        };
        f.write_str(text)
    }
}

/// Point-in-time view of one instance's queues
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueStatus {
    pub instance_id: InstanceId,
    pub main_queue: usize,
    pub retry_queue: usize,
    pub processing: bool,
    pub stats: QueueStats,
    /// Rounded percentage, `None` before any message has finished
    pub success_rate: Option<u8>,
}

impl QueueStatus {
    pub fn new(
        instance_id: InstanceId,
        main_queue: usize,
        retry_queue: usize,
        processing: bool,
        stats: QueueStats,
    ) -> Self {
        Self {
            instance_id,
            main_queue,
            retry_queue,
            processing,
            success_rate: stats.success_rate().map(|rate| rate.round() as u8),
            stats,
        }
    }

    /// Empty status for an instance that has never queued anything
    pub fn empty(instance_id: InstanceId) -> Self {
        Self::new(instance_id, 0, 0, false, QueueStats::default())
    }

    pub fn recommendations(&self) -> Vec<QueueRecommendation> {
        let mut hints = Vec::new();

        if self.success_rate.is_some_and(|rate| rate < LOW_SUCCESS_RATE) {
            hints.push(QueueRecommendation::LowSuccessRate);
        }
        if self.main_queue > HIGH_BACKLOG {
            hints.push(QueueRecommendation::HighBacklog);
        }
        if self.retry_queue > HIGH_RETRY_BACKLOG {
            hints.push(QueueRecommendation::RetryBacklog);
        }
        if self.processing {
            hints.push(QueueRecommendation::Processing);
        }
        if hints.is_empty() {
            hints.push(QueueRecommendation::Healthy);
        }

        hints
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn stats(sent: u64, failed: u64) -> QueueStats {
        QueueStats {
            queued: sent + failed,
            sent,
            failed,
            retried: 0,
        }
    }

    #[test]
    fn test_success_rate() {
        assert_eq!(QueueStats::default().success_rate(), None);
        assert_relative_eq!(stats(2, 1).success_rate().unwrap(), 66.666_666, epsilon = 1e-4);
        assert_relative_eq!(stats(5, 0).success_rate().unwrap(), 100.0);
    }

    #[test]
    fn test_rounded_rate_in_status() {
        let status = QueueStatus::new(InstanceId::from("a"), 0, 0, false, stats(2, 1));
        assert_eq!(status.success_rate, Some(67));
    }

    #[test]
    fn test_fresh_queue_is_healthy() {
        let status = QueueStatus::empty(InstanceId::from("a"));
        assert_eq!(status.recommendations(), vec![QueueRecommendation::Healthy]);
    }

    #[test]
    fn test_all_warnings() {
        let status = QueueStatus::new(InstanceId::from("a"), 11, 6, true, stats(1, 9));
        assert_eq!(
            status.recommendations(),
            vec![
                QueueRecommendation::LowSuccessRate,
                QueueRecommendation::HighBacklog,
                QueueRecommendation::RetryBacklog,
                QueueRecommendation::Processing,
            ]
        );
    }

    #[test]
    fn test_thresholds_are_exclusive() {
        let status = QueueStatus::new(InstanceId::from("a"), 10, 5, false, stats(7, 3));
        assert_eq!(status.recommendations(), vec![QueueRecommendation::Healthy]);
    }
}
