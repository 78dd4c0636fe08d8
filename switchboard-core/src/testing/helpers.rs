//! Builders for wiring a supervisor, queue and gateway against mocks

use super::{MemorySessionStore, MockTransport};
use crate::config::{Config, SupervisorConfig, TenantConfig};
use crate::core::types::{InstanceId, MessagePayload};
use crate::directory::StaticDirectory;
use crate::gateway::Gateway;
use crate::monitoring::MetricsRegistry;
use crate::supervisor::ConnectionSupervisor;
use std::sync::Arc;
use std::time::Duration;

/// Supervisor plus the mocks behind it
pub struct SupervisorHarness {
    pub supervisor: ConnectionSupervisor,
    pub transport: MockTransport,
    pub store: Arc<MemorySessionStore>,
    pub metrics: Arc<MetricsRegistry>,
}

pub fn supervisor_harness(config: SupervisorConfig) -> SupervisorHarness {
    supervisor_harness_with(config, MockTransport::new(), MemorySessionStore::new())
}

pub fn supervisor_harness_with(
    config: SupervisorConfig,
    transport: MockTransport,
    store: MemorySessionStore,
) -> SupervisorHarness {
    let store = Arc::new(store);
    let metrics = Arc::new(MetricsRegistry::new().expect("metrics registry"));
    let supervisor = ConnectionSupervisor::new(
        config,
        Arc::new(transport.clone()),
        store.clone(),
        metrics.clone(),
    );

    SupervisorHarness {
        supervisor,
        transport,
        store,
        metrics,
    }
}

/// Gateway plus the mocks behind it
pub struct GatewayHarness {
    pub gateway: Gateway,
    pub transport: MockTransport,
    pub store: Arc<MemorySessionStore>,
    pub directory: Arc<StaticDirectory>,
}

/// One tenant `acme` with token `acme-token` owning instances `a` and `b`
pub fn test_tenants() -> Vec<TenantConfig> {
    vec![TenantConfig {
        id: "acme".to_string(),
        name: Some("Acme".to_string()),
        token: "acme-token".to_string(),
        instances: vec!["a".to_string(), "b".to_string()],
        monthly_limit: Some(1_000),
    }]
}

pub fn gateway_harness(config: Config, transport: MockTransport) -> GatewayHarness {
    let store = Arc::new(MemorySessionStore::new());
    let directory = Arc::new(StaticDirectory::from_config(&config.tenants));
    let metrics = Arc::new(MetricsRegistry::new().expect("metrics registry"));
    let gateway = Gateway::new(
        &config,
        Arc::new(transport.clone()),
        store.clone(),
        directory.clone(),
        metrics,
    );

    GatewayHarness {
        gateway,
        transport,
        store,
        directory,
    }
}

/// Let spawned tasks run. Under paused time this also advances the clock
/// by a few milliseconds.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

pub fn instance(id: &str) -> InstanceId {
    InstanceId::from(id)
}

pub fn text(n: usize) -> MessagePayload {
    MessagePayload::text("+15550100", format!("message {}", n))
}
