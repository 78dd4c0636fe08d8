//! Monitoring and observability
//!
//! Prometheus metrics plus an HTTP server exposing them alongside the
//! gateway health snapshot.

pub mod metrics;
pub mod server;

pub use metrics::{ConnectionMetrics, MetricsRegistry, QueueMetrics};
pub use server::{encode_metrics, MetricsServer, MetricsServerConfig};
