//! Switchboard gateway daemon
//!
//! Runs the connection supervisor and delivery queue against the simulated
//! transport, with file-backed sessions and tenants from the config file.
//! Serves Prometheus metrics and a health snapshot over HTTP.

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use switchboard_bins::common::{init_logging, install_shutdown_handler, load_config, CommonArgs};
use switchboard_core::monitoring::MetricsServerConfig;
use switchboard_core::{
    FileSessionStore, Gateway, InstanceId, MetricsRegistry, MetricsServer, SimulatedTransport,
    StaticDirectory,
};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let args = CommonArgs::parse();
    let config = load_config(&args)?;
    init_logging(&config)?;

    info!("=== Switchboard gateway ===");
    info!(
        tenants = config.tenants.len(),
        sessions_dir = %config.storage.sessions_dir.display(),
        "Configuration loaded"
    );

    let metrics = Arc::new(MetricsRegistry::new()?);
    let gateway = Gateway::new(
        &config,
        Arc::new(SimulatedTransport::new(config.simulation.clone())),
        Arc::new(FileSessionStore::new(&config.storage.sessions_dir)),
        Arc::new(StaticDirectory::from_config(&config.tenants)),
        metrics.clone(),
    );

    let (_shutdown_tx, shutdown_rx) = install_shutdown_handler()?;
    let tasks = gateway.spawn_background(shutdown_rx.clone());

    let server = if config.monitoring.enable_metrics {
        let server = MetricsServer::new(
            MetricsServerConfig::from_monitoring(&config.monitoring)?,
            metrics,
            Some(gateway.reporter().clone()),
        );
        let shutdown = shutdown_rx.clone();
        Some(tokio::spawn(async move { server.serve(shutdown).await }))
    } else {
        None
    };

    let known: Vec<InstanceId> = config
        .tenants
        .iter()
        .flat_map(|tenant| tenant.instances.iter().map(|id| InstanceId::new(id.as_str())))
        .collect();
    gateway.restore_sessions(&known).await;

    for id in &args.connect {
        let id = InstanceId::from(id.as_str());
        let outcome = gateway.supervisor().connect(&id).await;
        info!(instance = %id, ?outcome, "Startup connect");
    }

    let mut shutdown = shutdown_rx;
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            break;
        }
    }

    info!("Shutting down");
    gateway.stop(tasks).await;
    if let Some(server) = server {
        match server.await {
            Ok(Err(e)) => warn!(error = %e, "Metrics server stopped with an error"),
            Err(e) => warn!(error = %e, "Metrics server task failed"),
            Ok(Ok(())) => {}
        }
    }

    let health = gateway.health_snapshot();
    info!(
        score = health.health_score,
        pending = health.queues.pending,
        sent = health.queues.sent,
        failed = health.queues.failed,
        "Final status"
    );
    Ok(())
}
