//! Core types for the gateway
//!
//! - `types`: instance and message identifiers, outbound payloads
//! - `errors`: error taxonomy for every collaborator boundary
//! - `connection_fsm`: per-instance connection state machine

pub mod connection_fsm;
pub mod errors;
pub mod types;

pub use connection_fsm::{ConnectionLifecycle, InstanceStatus, TransitionError};
pub use errors::{
    DirectoryError, DisconnectReason, GatewayError, PersistenceError, QrWaitError, QueueError,
    SendError, TransportError, UnavailableReason,
};
pub use types::{InstanceId, MessageId, MessagePayload};
