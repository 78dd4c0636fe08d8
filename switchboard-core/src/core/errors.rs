//! Error types for connection supervision and message delivery
//!
//! Every collaborator boundary (transport, persistence, tenant directory)
//! gets its own error type so callers can tell a transient network problem
//! apart from a bad session or a full queue.

use crate::core::types::InstanceId;
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Why a transport connection went away.
///
/// The close code is classified once, at the transport boundary. Everything
/// downstream matches on the variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DisconnectReason {
    /// Another client took over the same account
    ProtocolConflict,
    /// Connection timed out at the network layer
    NetworkTimeout,
    /// Server revoked the session; credentials are no longer valid
    SessionInvalidated,
    /// Any other close
    TransientDisconnect {
        /// Raw close code, when the transport reported one
        code: Option<u16>,
        message: String,
    },
}

impl DisconnectReason {
    /// Close codes used by the messaging network
    pub const LOGGED_OUT: u16 = 401;
    pub const TIMED_OUT: u16 = 408;
    pub const CONFLICT: u16 = 440;

    /// Classify a raw close code
    pub fn from_status_code(code: u16, message: impl Into<String>) -> Self {
        match code {
            Self::LOGGED_OUT => DisconnectReason::SessionInvalidated,
            Self::TIMED_OUT => DisconnectReason::NetworkTimeout,
            Self::CONFLICT => DisconnectReason::ProtocolConflict,
            other => DisconnectReason::TransientDisconnect {
                code: Some(other),
                message: message.into(),
            },
        }
    }

    pub fn is_network_timeout(&self) -> bool {
        matches!(self, DisconnectReason::NetworkTimeout)
    }

    /// Short label used for logs and metric labels
    pub fn label(&self) -> &'static str {
        match self {
            DisconnectReason::ProtocolConflict => "conflict",
            DisconnectReason::NetworkTimeout => "network_timeout",
            DisconnectReason::SessionInvalidated => "logged_out",
            DisconnectReason::TransientDisconnect { .. } => "transient",
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::TransientDisconnect {
                code: Some(code),
                message,
            } => write!(f, "transient disconnect ({}): {}", code, message),
            DisconnectReason::TransientDisconnect { code: None, message } => {
                write!(f, "transient disconnect: {}", message)
            }
            other => f.write_str(other.label()),
        }
    }
}

/// Errors raised by a transport implementation
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("failed to open connection: {0}")]
    Open(String),

    /// The connection was closed while the operation was in flight
    #[error("connection closed: {0}")]
    Closed(DisconnectReason),

    #[error("no live connection")]
    NotConnected,

    #[error("send rejected: {0}")]
    Send(String),
}

impl TransportError {
    /// Disconnect classification for errors that end a connection attempt
    pub fn disconnect_reason(&self) -> DisconnectReason {
        match self {
            TransportError::Closed(reason) => reason.clone(),
            other => DisconnectReason::TransientDisconnect {
                code: None,
                message: other.to_string(),
            },
        }
    }
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("session store I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("session data is not valid JSON: {0}")]
    Serde(#[from] serde_json::Error),

    /// Instance id cannot be used as a storage key
    #[error("invalid instance id for storage: {0:?}")]
    InvalidInstanceId(String),
}

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("tenant directory unavailable: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    /// Main queue for this instance is at capacity
    #[error("queue for {instance_id} is full ({capacity} messages)")]
    QueueFull {
        instance_id: InstanceId,
        capacity: usize,
    },
}

/// Failure of a single delivery attempt
#[derive(Debug, Clone, Error)]
pub enum SendError {
    /// Instance has no open connection; the message was never handed over
    #[error("instance is not connected")]
    NotConnected,

    #[error("send timed out after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Why a connect request was refused without opening a connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UnavailableReason {
    /// Too many recent failures; retry after the cooldown
    CircuitOpen { remaining: Duration },
    /// A conflict happened too recently
    ConflictCooldown { remaining: Duration },
    /// The transport failed to open
    OpenFailed { message: String },
    /// Attempt was cancelled by a logout or sweep before it completed
    Superseded,
    ShuttingDown,
}

impl fmt::Display for UnavailableReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnavailableReason::CircuitOpen { remaining } => {
                write!(f, "circuit breaker open, retry in {}s", remaining.as_secs())
            }
            UnavailableReason::ConflictCooldown { remaining } => {
                write!(f, "recent conflict, retry in {}s", remaining.as_secs())
            }
            UnavailableReason::OpenFailed { message } => write!(f, "open failed: {}", message),
            UnavailableReason::Superseded => f.write_str("connection attempt superseded"),
            UnavailableReason::ShuttingDown => f.write_str("gateway is shutting down"),
        }
    }
}

/// Outcome of waiting for a pairing code
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QrWaitError {
    #[error("no pairing code issued within {0:?}")]
    Timeout(Duration),

    /// Instance connected without needing a pairing code
    #[error("instance is already paired")]
    AlreadyPaired,

    #[error("session ended while waiting for a pairing code")]
    SessionLost,
}

/// Errors surfaced by the gateway facade
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("invalid access token")]
    Unauthorized,

    /// Instance does not exist or belongs to another tenant
    #[error("instance {0} is not valid for this tenant")]
    InstanceInvalidated(InstanceId),

    #[error("monthly message quota exceeded")]
    QuotaExceeded,

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("connection unavailable: {0}")]
    Unavailable(UnavailableReason),

    #[error(transparent)]
    Qr(#[from] QrWaitError),

    #[error(transparent)]
    Directory(#[from] DirectoryError),
}
