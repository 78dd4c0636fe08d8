//! Per-instance delivery queues
//!
//! Each instance has a FIFO main queue, a retry queue of messages waiting
//! out their retry delay, and a `processing` flag. One message is in flight
//! per instance at a time. A message lives in exactly one of: the main
//! queue, the retry queue, or the in-flight slot of a running drain tick.
//!
//! Messages are only sent while the [`DeliveryTarget`] reports the instance
//! ready. A send refused with [`SendError::NotConnected`] goes back to the
//! front of the main queue without costing an attempt, so a conflict or
//! reconnect never drops queued messages.

mod message;
mod status;

pub use message::{MessageStatus, QueuedMessage};
pub use status::{QueueRecommendation, QueueStats, QueueStatus};

use crate::config::QueueConfig;
use crate::core::errors::{QueueError, SendError};
use crate::core::types::{InstanceId, MessageId, MessagePayload};
use crate::monitoring::{MetricsRegistry, QueueMetrics};
use crate::resilience::QueueTotals;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Finished message ids remembered per instance for status lookups
const FINISHED_HISTORY: usize = 1000;

/// Where drained messages go
#[async_trait]
pub trait DeliveryTarget: Send + Sync + 'static {
    /// Whether the instance can take a message right now
    fn is_ready(&self, instance_id: &InstanceId) -> bool;

    async fn send(&self, instance_id: &InstanceId, payload: &MessagePayload)
        -> Result<(), SendError>;
}

/// Result of one [`DeliveryQueue::drain_tick`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Nothing queued
    Idle,
    /// Messages are waiting but the instance is not ready
    NotReady,
    /// Another tick is already sending for this instance
    Busy,
    Sent(MessageId),
    /// Send failed; the message waits in the retry queue
    Retrying { message_id: MessageId, attempts: u32 },
    /// Send failed and the message ran out of attempts
    Failed { message_id: MessageId, attempts: u32 },
    /// Connection went away before the hand-over; message is back at the front
    Requeued(MessageId),
}

#[derive(Default)]
struct InstanceQueue {
    main: VecDeque<QueuedMessage>,
    retry: VecDeque<QueuedMessage>,
    processing: bool,
    in_flight: Option<MessageId>,
    stats: QueueStats,
    finished: VecDeque<(MessageId, MessageStatus)>,
}

impl InstanceQueue {
    /// Move due retries to the front of the main queue, keeping their order
    fn promote_due(&mut self, now: Instant) -> usize {
        let mut due = Vec::new();
        let mut waiting = VecDeque::with_capacity(self.retry.len());
        for message in self.retry.drain(..) {
            if message.is_due(now) {
                due.push(message);
            } else {
                waiting.push_back(message);
            }
        }
        self.retry = waiting;

        let promoted = due.len();
        for message in due.into_iter().rev() {
            self.main.push_front(message);
        }
        promoted
    }

    fn record_finished(&mut self, id: MessageId, status: MessageStatus) {
        if self.finished.len() == FINISHED_HISTORY {
            self.finished.pop_front();
        }
        self.finished.push_back((id, status));
    }

    fn message_status(&self, id: MessageId) -> Option<MessageStatus> {
        if self.in_flight == Some(id) {
            return Some(MessageStatus::Processing);
        }
        self.main
            .iter()
            .chain(self.retry.iter())
            .find(|m| m.id == id)
            .map(|m| m.status)
            .or_else(|| {
                self.finished
                    .iter()
                    .rev()
                    .find(|(finished, _)| *finished == id)
                    .map(|(_, status)| *status)
            })
    }

    fn has_pending(&self) -> bool {
        !self.main.is_empty() || !self.retry.is_empty()
    }
}

struct QueueInner {
    config: QueueConfig,
    target: Arc<dyn DeliveryTarget>,
    queues: DashMap<InstanceId, Arc<Mutex<InstanceQueue>>>,
    metrics: Arc<MetricsRegistry>,
}

/// Cheap to clone; clones share the same queues
#[derive(Clone)]
pub struct DeliveryQueue {
    inner: Arc<QueueInner>,
}

impl DeliveryQueue {
    pub fn new(
        config: QueueConfig,
        target: Arc<dyn DeliveryTarget>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                config,
                target,
                queues: DashMap::new(),
                metrics,
            }),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    fn metrics(&self) -> &QueueMetrics {
        self.inner.metrics.queue()
    }

    /// Append a message to the instance's main queue
    pub fn enqueue(
        &self,
        instance_id: &InstanceId,
        payload: MessagePayload,
    ) -> Result<MessageId, QueueError> {
        let capacity = self.inner.config.max_queue_size;
        let slot = self.slot(instance_id);

        let (id, depth) = {
            let mut queue = slot.lock();
            if queue.main.len() >= capacity {
                self.metrics().rejected_total.inc();
                warn!(instance = %instance_id, capacity, "Queue full, rejecting message");
                return Err(QueueError::QueueFull {
                    instance_id: instance_id.clone(),
                    capacity,
                });
            }

            let message = QueuedMessage::new(instance_id.clone(), payload, Instant::now());
            let id = message.id;
            queue.main.push_back(message);
            queue.stats.queued += 1;
            (id, queue.main.len())
        };

        self.metrics().enqueued_total.inc();
        self.set_depth(instance_id, "main", depth);
        debug!(instance = %instance_id, message = %id, depth, "Message queued");
        Ok(id)
    }

    /// Promote due retries, then send at most one message if the instance
    /// is ready and nothing else is in flight.
    pub async fn drain_tick(&self, instance_id: &InstanceId) -> DrainOutcome {
        let Some(slot) = self.existing_slot(instance_id) else {
            return DrainOutcome::Idle;
        };
        let now = Instant::now();

        {
            let mut queue = slot.lock();
            let promoted = queue.promote_due(now);
            if promoted > 0 {
                debug!(instance = %instance_id, promoted, "Retries moved to the front of the queue");
            }
            self.update_depths(instance_id, &queue);
            if queue.processing {
                return DrainOutcome::Busy;
            }
            if queue.main.is_empty() {
                return DrainOutcome::Idle;
            }
        }

        if !self.inner.target.is_ready(instance_id) {
            return DrainOutcome::NotReady;
        }

        let mut message = {
            let mut queue = slot.lock();
            if queue.processing {
                return DrainOutcome::Busy;
            }
            let Some(mut message) = queue.main.pop_front() else {
                return DrainOutcome::Idle;
            };
            message.status = MessageStatus::Processing;
            queue.processing = true;
            queue.in_flight = Some(message.id);
            self.update_depths(instance_id, &queue);
            message
        };

        let timeout = self.inner.config.send_timeout();
        let result = match tokio::time::timeout(
            timeout,
            self.inner.target.send(instance_id, &message.payload),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(SendError::Timeout(timeout)),
        };

        let mut queue = slot.lock();
        queue.processing = false;
        queue.in_flight = None;

        let outcome = match result {
            Ok(()) => {
                message.status = MessageStatus::Sent;
                queue.stats.sent += 1;
                queue.record_finished(message.id, MessageStatus::Sent);
                self.metrics().sent_total.inc();
                debug!(instance = %instance_id, message = %message.id, "Message sent");
                DrainOutcome::Sent(message.id)
            }
            Err(SendError::NotConnected) => {
                let id = message.id;
                message.status = if message.attempts > 0 {
                    MessageStatus::Retry
                } else {
                    MessageStatus::Queued
                };
                queue.main.push_front(message);
                debug!(instance = %instance_id, message = %id, "Instance went away, message requeued");
                DrainOutcome::Requeued(id)
            }
            Err(e) => {
                message.attempts += 1;
                message.last_error = Some(e.to_string());
                let attempts = message.attempts;
                let id = message.id;

                if attempts < self.inner.config.max_retries {
                    message.status = MessageStatus::Retry;
                    message.retry_at = Some(Instant::now() + self.inner.config.retry_delay());
                    queue.retry.push_back(message);
                    queue.stats.retried += 1;
                    self.metrics().retried_total.inc();
                    warn!(instance = %instance_id, message = %id, attempts, error = %e, "Send failed, will retry");
                    DrainOutcome::Retrying {
                        message_id: id,
                        attempts,
                    }
                } else {
                    message.status = MessageStatus::Failed;
                    queue.stats.failed += 1;
                    queue.record_finished(id, MessageStatus::Failed);
                    self.metrics().failed_total.inc();
                    warn!(instance = %instance_id, message = %id, attempts, error = %e, "Send failed, giving up");
                    DrainOutcome::Failed {
                        message_id: id,
                        attempts,
                    }
                }
            }
        };

        self.update_depths(instance_id, &queue);
        outcome
    }

    pub fn message_status(
        &self,
        instance_id: &InstanceId,
        message_id: MessageId,
    ) -> Option<MessageStatus> {
        let slot = self.existing_slot(instance_id)?;
        let queue = slot.lock();
        queue.message_status(message_id)
    }

    pub fn status(&self, instance_id: &InstanceId) -> QueueStatus {
        match self.existing_slot(instance_id) {
            Some(slot) => {
                let queue = slot.lock();
                QueueStatus::new(
                    instance_id.clone(),
                    queue.main.len(),
                    queue.retry.len(),
                    queue.processing,
                    queue.stats,
                )
            }
            None => QueueStatus::empty(instance_id.clone()),
        }
    }

    /// Sums across every instance
    pub fn totals(&self) -> QueueTotals {
        let mut totals = QueueTotals::default();
        for (_, slot) in self.slots() {
            let queue = slot.lock();
            totals.pending += queue.main.len();
            totals.retrying += queue.retry.len();
            totals.processing += usize::from(queue.processing);
            totals.sent += queue.stats.sent;
            totals.failed += queue.stats.failed;
        }
        totals
    }

    /// Drop both queues for an instance. Returns the number of messages discarded.
    pub fn clear_instance(&self, instance_id: &InstanceId) -> usize {
        let Some((_, slot)) = self.inner.queues.remove(instance_id) else {
            return 0;
        };

        let dropped = {
            let queue = slot.lock();
            queue.main.len() + queue.retry.len()
        };
        self.set_depth(instance_id, "main", 0);
        self.set_depth(instance_id, "retry", 0);

        if dropped > 0 {
            info!(instance = %instance_id, dropped, "Queue cleared");
        }
        dropped
    }

    pub fn instance_ids(&self) -> Vec<InstanceId> {
        self.inner
            .queues
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    fn has_pending(&self, instance_id: &InstanceId) -> bool {
        self.existing_slot(instance_id)
            .is_some_and(|slot| slot.lock().has_pending())
    }

    /// Run drain ticks for every instance on the configured interval until
    /// `shutdown` flips to true. In-flight sends are awaited before the
    /// task exits.
    pub fn spawn_processor(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let queue = self.clone();
        let interval = self.inner.config.drain_interval();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut in_flight = JoinSet::new();
            info!(interval_ms = interval.as_millis() as u64, "Delivery queue processor started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        for id in queue.instance_ids() {
                            if !queue.has_pending(&id) {
                                continue;
                            }
                            let queue = queue.clone();
                            in_flight.spawn(async move { queue.drain_tick(&id).await });
                        }
                    }
                    Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                        if let Err(e) = joined {
                            warn!(error = %e, "Drain task failed");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }

            let remaining = in_flight.len();
            while let Some(joined) = in_flight.join_next().await {
                if let Err(e) = joined {
                    warn!(error = %e, "Drain task failed during shutdown");
                }
            }
            info!(remaining, "Delivery queue processor stopped");
        })
    }

    fn update_depths(&self, instance_id: &InstanceId, queue: &InstanceQueue) {
        self.set_depth(instance_id, "main", queue.main.len());
        self.set_depth(instance_id, "retry", queue.retry.len());
    }

    fn set_depth(&self, instance_id: &InstanceId, which: &str, depth: usize) {
        self.metrics()
            .depth
            .with_label_values(&[instance_id.as_str(), which])
            .set(depth as i64);
    }

    fn slot(&self, instance_id: &InstanceId) -> Arc<Mutex<InstanceQueue>> {
        let entry = self
            .inner
            .queues
            .entry(instance_id.clone())
            .or_default();
        Arc::clone(entry.value())
    }

    fn existing_slot(&self, instance_id: &InstanceId) -> Option<Arc<Mutex<InstanceQueue>>> {
        self.inner
            .queues
            .get(instance_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    fn slots(&self) -> Vec<(InstanceId, Arc<Mutex<InstanceQueue>>)> {
        self.inner
            .queues
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect()
    }
}
