//! Identifiers and payload types shared across the gateway

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identity of one tenant-owned messaging connection.
///
/// Instance ids double as directory names for persisted sessions, so the
/// store validates them before touching the filesystem.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(String);

impl InstanceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for InstanceId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for InstanceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Unique id assigned to every enqueued message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "msg_{}", self.0.simple())
    }
}

/// Outbound message body handed to the transport.
///
/// `content` is opaque to the gateway: text, media references and
/// interactive messages all travel as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub recipient: String,
    pub content: serde_json::Value,
}

impl MessagePayload {
    pub fn new(recipient: impl Into<String>, content: serde_json::Value) -> Self {
        Self {
            recipient: recipient.into(),
            content,
        }
    }

    /// Plain text message
    pub fn text(recipient: impl Into<String>, body: impl Into<String>) -> Self {
        Self::new(recipient, serde_json::json!({ "text": body.into() }))
    }
}
