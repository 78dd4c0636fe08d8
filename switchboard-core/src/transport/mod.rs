//! Transport abstraction
//!
//! A transport opens one connection per instance. The connection is split
//! into a session handle (send, close) and a stream of lifecycle events. The
//! supervisor owns the session and drains the event stream; when the
//! transport drops its event sender the supervisor treats the connection as
//! closed.

pub mod simulated;

use crate::core::errors::{DisconnectReason, TransportError};
use crate::core::types::{InstanceId, MessagePayload};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

pub use simulated::{SimulatedTransport, SimulationConfig};

/// Opaque session credentials produced by the transport after pairing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Credentials(pub serde_json::Value);

/// Account the connection is logged in as
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
}

/// Lifecycle events emitted by an open connection
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Opened(UserInfo),
    Closed(DisconnectReason),
    /// Another client took over the account
    Conflict,
    /// Server revoked the session
    LoggedOut,
    /// Pairing code the user must scan
    QrCodeIssued(String),
    CredentialsUpdated(Credentials),
}

/// Handle to one live transport connection
#[async_trait]
pub trait TransportSession: Send + Sync {
    async fn send(&self, payload: &MessagePayload) -> Result<(), TransportError>;

    /// Close the connection and release its resources. Must be idempotent.
    async fn close(&self);
}

/// A freshly opened connection
pub struct TransportConnection {
    pub session: Arc<dyn TransportSession>,
    pub events: mpsc::Receiver<TransportEvent>,
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open a connection. `credentials` is `None` when the instance has
    /// never been paired.
    async fn open(
        &self,
        instance_id: &InstanceId,
        credentials: Option<Credentials>,
    ) -> Result<TransportConnection, TransportError>;
}
