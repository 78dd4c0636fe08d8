//! Prometheus metrics for gateway monitoring
//!
//! Two metric families:
//! - Connection supervision (attempts, rejections, conflicts, breaker trips)
//! - Delivery queue (enqueued, sent, failed, retried, depth)

use prometheus::{IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry};
use std::sync::Arc;
use tracing::info;

const NAMESPACE: &str = "switchboard";

/// Central registry for all Prometheus metrics
#[derive(Clone)]
pub struct MetricsRegistry {
    registry: Arc<Registry>,
    connection: Arc<ConnectionMetrics>,
    queue: Arc<QueueMetrics>,
}

impl MetricsRegistry {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Arc::new(Registry::new());

        let connection = Arc::new(ConnectionMetrics::new(&registry)?);
        let queue = Arc::new(QueueMetrics::new(&registry)?);

        info!("Prometheus metrics registry initialized");

        Ok(Self {
            registry,
            connection,
            queue,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn connection(&self) -> &ConnectionMetrics {
        &self.connection
    }

    pub fn queue(&self) -> &QueueMetrics {
        &self.queue
    }
}

/// Connection supervision metrics
pub struct ConnectionMetrics {
    /// Connect attempts that reached the transport
    pub connect_attempts_total: IntCounter,
    /// Connect requests refused, by reason
    pub connect_rejected_total: IntCounterVec,
    /// Disconnects by classification
    pub disconnects_total: IntCounterVec,
    pub conflicts_total: IntCounter,
    /// Instances whose retries stopped after repeated network timeouts
    pub network_timeout_stops_total: IntCounter,
    pub breaker_trips_total: IntCounter,
    pub retries_scheduled_total: IntCounter,
    /// Tracked instances by connection status
    pub instances_by_status: IntGaugeVec,
    /// Most recently computed health score (0-100)
    pub health_score: IntGauge,
}

impl ConnectionMetrics {
    fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let connect_attempts_total = IntCounter::with_opts(
            Opts::new(
                "connection_attempts_total",
                "Connect attempts handed to the transport",
            )
            .namespace(NAMESPACE),
        )?;
        registry.register(Box::new(connect_attempts_total.clone()))?;

        let connect_rejected_total = IntCounterVec::new(
            Opts::new(
                "connection_rejected_total",
                "Connect requests refused before reaching the transport",
            )
            .namespace(NAMESPACE),
            &["reason"],
        )?;
        registry.register(Box::new(connect_rejected_total.clone()))?;

        let disconnects_total = IntCounterVec::new(
            Opts::new("connection_disconnects_total", "Connection closes by reason")
                .namespace(NAMESPACE),
            &["reason"],
        )?;
        registry.register(Box::new(disconnects_total.clone()))?;

        let conflicts_total = IntCounter::with_opts(
            Opts::new(
                "connection_conflicts_total",
                "Connections replaced by another client",
            )
            .namespace(NAMESPACE),
        )?;
        registry.register(Box::new(conflicts_total.clone()))?;

        let network_timeout_stops_total = IntCounter::with_opts(
            Opts::new(
                "connection_network_timeout_stops_total",
                "Instances that stopped retrying after consecutive network timeouts",
            )
            .namespace(NAMESPACE),
        )?;
        registry.register(Box::new(network_timeout_stops_total.clone()))?;

        let breaker_trips_total = IntCounter::with_opts(
            Opts::new("connection_breaker_trips_total", "Circuit breaker trips")
                .namespace(NAMESPACE),
        )?;
        registry.register(Box::new(breaker_trips_total.clone()))?;

        let retries_scheduled_total = IntCounter::with_opts(
            Opts::new(
                "connection_retries_scheduled_total",
                "Reconnection attempts scheduled",
            )
            .namespace(NAMESPACE),
        )?;
        registry.register(Box::new(retries_scheduled_total.clone()))?;

        let instances_by_status = IntGaugeVec::new(
            Opts::new("instances", "Tracked instances by connection status").namespace(NAMESPACE),
            &["status"],
        )?;
        registry.register(Box::new(instances_by_status.clone()))?;

        let health_score = IntGauge::with_opts(
            Opts::new("health_score", "Gateway health score (0-100)").namespace(NAMESPACE),
        )?;
        registry.register(Box::new(health_score.clone()))?;

        Ok(Self {
            connect_attempts_total,
            connect_rejected_total,
            disconnects_total,
            conflicts_total,
            network_timeout_stops_total,
            breaker_trips_total,
            retries_scheduled_total,
            instances_by_status,
            health_score,
        })
    }
}

/// Delivery queue metrics
pub struct QueueMetrics {
    pub enqueued_total: IntCounter,
    /// Enqueue requests refused because the queue was full
    pub rejected_total: IntCounter,
    pub sent_total: IntCounter,
    /// Messages that exhausted their attempts
    pub failed_total: IntCounter,
    pub retried_total: IntCounter,
    /// Messages waiting, by instance and queue (main or retry)
    pub depth: IntGaugeVec,
}

impl QueueMetrics {
    fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let enqueued_total = IntCounter::with_opts(
            Opts::new("queue_enqueued_total", "Messages accepted into a queue")
                .namespace(NAMESPACE),
        )?;
        registry.register(Box::new(enqueued_total.clone()))?;

        let rejected_total = IntCounter::with_opts(
            Opts::new("queue_rejected_total", "Messages refused by a full queue")
                .namespace(NAMESPACE),
        )?;
        registry.register(Box::new(rejected_total.clone()))?;

        let sent_total = IntCounter::with_opts(
            Opts::new("queue_sent_total", "Messages delivered to the transport")
                .namespace(NAMESPACE),
        )?;
        registry.register(Box::new(sent_total.clone()))?;

        let failed_total = IntCounter::with_opts(
            Opts::new("queue_failed_total", "Messages that exhausted their attempts")
                .namespace(NAMESPACE),
        )?;
        registry.register(Box::new(failed_total.clone()))?;

        let retried_total = IntCounter::with_opts(
            Opts::new("queue_retried_total", "Failed sends moved to the retry queue")
                .namespace(NAMESPACE),
        )?;
        registry.register(Box::new(retried_total.clone()))?;

        let depth = IntGaugeVec::new(
            Opts::new("queue_depth", "Messages waiting per instance and queue")
                .namespace(NAMESPACE),
            &["instance", "queue"],
        )?;
        registry.register(Box::new(depth.clone()))?;

        Ok(Self {
            enqueued_total,
            rejected_total,
            sent_total,
            failed_total,
            retried_total,
            depth,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::Encoder;

    #[test]
    fn test_registry_creation() {
        let metrics = MetricsRegistry::new().unwrap();
        metrics.connection().connect_attempts_total.inc();
        metrics.queue().enqueued_total.inc_by(3);

        assert_eq!(metrics.connection().connect_attempts_total.get(), 1);
        assert_eq!(metrics.queue().enqueued_total.get(), 3);
    }

    #[test]
    fn test_registries_are_independent() {
        let a = MetricsRegistry::new().unwrap();
        let b = MetricsRegistry::new().unwrap();
        a.connection().conflicts_total.inc();
        assert_eq!(b.connection().conflicts_total.get(), 0);
    }

    #[test]
    fn test_text_export_uses_namespace() {
        let metrics = MetricsRegistry::new().unwrap();
        metrics
            .queue()
            .depth
            .with_label_values(&["a", "main"])
            .set(4);

        let mut buffer = Vec::new();
        prometheus::TextEncoder::new()
            .encode(&metrics.registry().gather(), &mut buffer)
            .unwrap();
        let text = String::from_utf8(buffer).unwrap();
        assert!(text.contains("switchboard_queue_depth{instance=\"a\",queue=\"main\"} 4"));
    }
}
