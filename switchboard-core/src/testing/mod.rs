//! Testing utilities and mocks for integration tests
//!
//! Provides mock implementations and test helpers for:
//! - MockTransport: scriptable sessions with event injection
//! - MemorySessionStore: in-memory persistence sink
//! - RecordingTarget: delivery target with scripted send results
//! - Harness builders for supervisor and gateway tests

pub mod helpers;
pub mod mock_transport;
pub mod stores;

pub use helpers::*;
pub use mock_transport::{MockSession, MockTransport, OpenBehavior};
pub use stores::{MemorySessionStore, RecordingTarget};
