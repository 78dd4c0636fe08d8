use crate::core::types::{InstanceId, MessageId, MessagePayload};
use serde::Serialize;
use tokio::time::Instant;

/// Delivery state of one message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Queued,
    Processing,
    Sent,
    /// Waiting in the retry queue
    Retry,
    /// Attempts exhausted
    Failed,
}

impl MessageStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, MessageStatus::Sent | MessageStatus::Failed)
    }
}

#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub id: MessageId,
    pub instance_id: InstanceId,
    pub payload: MessagePayload,
    /// Send attempts made so far
    pub attempts: u32,
    pub status: MessageStatus,
    pub enqueued_at: Instant,
    /// When a message in the retry queue becomes eligible again
    pub retry_at: Option<Instant>,
    pub last_error: Option<String>,
}

impl QueuedMessage {
    pub fn new(instance_id: InstanceId, payload: MessagePayload, now: Instant) -> Self {
        Self {
            id: MessageId::new(),
            instance_id,
            payload,
            attempts: 0,
            status: MessageStatus::Queued,
            enqueued_at: now,
            retry_at: None,
            last_error: None,
        }
    }

    pub fn is_due(&self, now: Instant) -> bool {
        self.retry_at.map_or(true, |at| at <= now)
    }
}
