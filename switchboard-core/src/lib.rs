//! Switchboard Core - Connection supervision for a multi-tenant messaging gateway
//!
//! Switchboard keeps one long-lived connection per tenant instance to an
//! external messaging network and delivers queued outbound messages over it.
//! Its job is to stop reconnect storms: each instance gets exactly one live
//! connection attempt, a circuit breaker, a conflict cooldown and a hard stop
//! after repeated network timeouts.
//!
//! ## Architecture
//! - **One state object per instance**, behind a short-lived lock
//! - **Generation tags** so events from superseded connections are ignored
//! - **At most one retry timer** per instance; a later schedule cancels the earlier
//! - **One message in flight** per instance; failed sends go to a retry queue
//!
//! ## Core Modules
//! - `core`: Ids, payloads, errors and the connection state machine
//! - `resilience`: Circuit breaker, backoff, retry scheduler, health scoring
//! - `supervisor`: Connection lifecycle per instance
//! - `queue`: Per-instance delivery queues and the drain loop
//! - `gateway`: Tenant-facing facade with token and quota checks
//! - `transport`, `persistence`, `directory`: Collaborator traits and implementations
//! - `monitoring`: Prometheus metrics and the status HTTP server

pub mod config;
pub mod core;
pub mod directory;
pub mod gateway;
pub mod monitoring;
pub mod persistence;
pub mod queue;
pub mod resilience;
pub mod supervisor;
pub mod transport;
pub mod utils;

// Mocks and harness builders for tests
pub mod testing;

pub use crate::config::Config;
pub use crate::core::{
    ConnectionLifecycle, DisconnectReason, GatewayError, InstanceId, InstanceStatus, MessageId,
    MessagePayload, QueueError, SendError, TransportError, UnavailableReason,
};
pub use directory::{StaticDirectory, TenantDirectory};
pub use gateway::{Access, Gateway};
pub use monitoring::{MetricsRegistry, MetricsServer};
pub use persistence::{FileSessionStore, PersistenceSink};
pub use queue::{DeliveryQueue, DeliveryTarget, DrainOutcome, QueueStatus};
pub use resilience::{HealthReporter, HealthSnapshot};
pub use supervisor::{CircuitStatus, ConnectOutcome, ConnectionSupervisor};
pub use transport::{SimulatedTransport, Transport};

// Re-export error types
pub use anyhow::{Error, Result};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::core::{InstanceId, InstanceStatus, MessageId, MessagePayload};

    pub use crate::gateway::{Access, Gateway};
    pub use crate::queue::{DeliveryQueue, DrainOutcome};
    pub use crate::supervisor::{ConnectOutcome, ConnectionSupervisor};

    pub use crate::{Error, Result};
}
