//! Gateway facade and health reporting tests

use std::time::Duration;
use switchboard_core::config::{Config, SupervisorConfig};
use switchboard_core::core::{GatewayError, InstanceStatus, TransportError, UnavailableReason};
use switchboard_core::persistence::PersistenceSink;
use switchboard_core::resilience::HealthStatus;
use switchboard_core::testing::{
    gateway_harness, instance, settle, test_tenants, text, MockTransport, OpenBehavior,
};
use switchboard_core::transport::Credentials;
use tokio::sync::watch;

fn config() -> Config {
    Config {
        tenants: test_tenants(),
        ..Config::default()
    }
}

// ============================================================================
// PAIRING AND LOGOUT
// ============================================================================

/// Test: qr_code_starts_connection
#[tokio::test(start_paused = true)]
async fn test_qr_code_starts_connection() {
    let h = gateway_harness(config(), MockTransport::with_behavior(OpenBehavior::IssueQr));
    let access = h.gateway.authorize("acme-token", &instance("a")).await.unwrap();

    let code = h.gateway.qr_code(&access).await.unwrap();
    assert_eq!(code, "qr-a");
    assert_eq!(h.transport.open_count(&instance("a")), 1);

    // A second request reuses the pending pairing
    let again = h.gateway.qr_code(&access).await.unwrap();
    assert_eq!(again, "qr-a");
    assert_eq!(h.transport.open_count(&instance("a")), 1);
}

/// Test: qr_code_on_paired_instance
#[tokio::test(start_paused = true)]
async fn test_qr_code_on_paired_instance() {
    let h = gateway_harness(config(), MockTransport::with_behavior(OpenBehavior::AutoOpen));
    let access = h.gateway.authorize("acme-token", &instance("a")).await.unwrap();

    h.gateway.connect(&access).await.unwrap();
    settle().await;

    assert!(matches!(
        h.gateway.qr_code(&access).await,
        Err(GatewayError::Qr(_))
    ));
}

/// Test: qr_code_resets_open_breaker
#[tokio::test(start_paused = true)]
async fn test_qr_code_resets_open_breaker() {
    let mut config = config();
    config.supervisor = SupervisorConfig {
        failure_threshold: 1,
        ..SupervisorConfig::default()
    };
    let h = gateway_harness(config, MockTransport::with_behavior(OpenBehavior::IssueQr));
    let id = instance("a");
    let access = h.gateway.authorize("acme-token", &id).await.unwrap();

    h.transport
        .fail_next_open(&id, TransportError::Open("refused".to_string()));
    assert!(h.gateway.connect(&access).await.is_err());
    assert!(matches!(
        h.gateway.connect(&access).await,
        Err(GatewayError::Unavailable(UnavailableReason::CircuitOpen { .. }))
    ));

    assert_eq!(h.gateway.qr_code(&access).await.unwrap(), "qr-a");
}

/// Test: logout_clears_queue_and_session
#[tokio::test(start_paused = true)]
async fn test_logout_clears_queue_and_session() {
    let h = gateway_harness(config(), MockTransport::with_behavior(OpenBehavior::AutoOpen));
    let id = instance("a");
    let access = h.gateway.authorize("acme-token", &id).await.unwrap();

    h.gateway.connect(&access).await.unwrap();
    settle().await;
    h.gateway.enqueue_send(&access, text(1)).await.unwrap();
    h.gateway.enqueue_send(&access, text(2)).await.unwrap();

    h.gateway.logout(&access).await;

    assert_eq!(h.gateway.queue_status(&access).main_queue, 0);
    assert!(h.gateway.circuit_status(&access).is_none());
    assert_eq!(h.transport.live_sessions(&id), 0);
    assert_eq!(h.store.delete_count(), 1);
}

/// Test: restore_sessions_reconnects_paired_instances
#[tokio::test(start_paused = true)]
async fn test_restore_sessions_reconnects_paired_instances() {
    let h = gateway_harness(config(), MockTransport::with_behavior(OpenBehavior::AutoOpen));
    let (a, b) = (instance("a"), instance("b"));
    h.store
        .save_credentials(&a, &Credentials(serde_json::json!({ "k": "v" })))
        .await
        .unwrap();

    let started = h.gateway.restore_sessions(&[a.clone(), b.clone()]).await;
    assert_eq!(started, 1);
    settle().await;

    assert!(h.gateway.supervisor().is_open(&a));
    assert_eq!(h.gateway.supervisor().status(&b), None);
}

// ============================================================================
// HEALTH
// ============================================================================

/// Test: empty_gateway_is_healthy
#[tokio::test(start_paused = true)]
async fn test_empty_gateway_is_healthy() {
    let h = gateway_harness(config(), MockTransport::new());
    let snapshot = h.gateway.health_snapshot();
    assert_eq!(snapshot.health_score, 100);
    assert_eq!(snapshot.status, HealthStatus::Healthy);
    assert_eq!(snapshot.total_instances, 0);
}

/// Test: health_penalizes_inactive_and_open_breakers
///
/// One open instance and one with a tripped breaker:
/// 100 - 0.5 * 40 - 1 * 15 = 65
#[tokio::test(start_paused = true)]
async fn test_health_penalizes_inactive_and_open_breakers() {
    let mut config = config();
    config.supervisor = SupervisorConfig {
        failure_threshold: 1,
        ..SupervisorConfig::default()
    };
    let h = gateway_harness(config, MockTransport::with_behavior(OpenBehavior::AutoOpen));
    let (a, b) = (instance("a"), instance("b"));
    let access_b = h.gateway.authorize("acme-token", &b).await.unwrap();

    h.gateway.supervisor().connect(&a).await;
    settle().await;

    h.transport
        .fail_next_open(&b, TransportError::Open("refused".to_string()));
    h.gateway.supervisor().connect(&b).await;
    h.gateway.enqueue_send(&access_b, text(1)).await.unwrap();

    let snapshot = h.gateway.health_snapshot();
    assert_eq!(snapshot.total_instances, 2);
    assert_eq!(snapshot.open, 1);
    assert_eq!(snapshot.circuit_open, 1);
    assert_eq!(snapshot.health_score, 65);
    assert_eq!(snapshot.status, HealthStatus::Degraded);
    assert_eq!(snapshot.queues.pending, 1);
    assert_eq!(snapshot.instances[0].instance_id, a);
    assert_eq!(snapshot.instances[1].status, InstanceStatus::CircuitOpen);

    // Building a snapshot does not change state
    assert_eq!(h.gateway.health_snapshot().health_score, 65);
}

// ============================================================================
// BACKGROUND TASKS
// ============================================================================

/// Test: background_tasks_deliver_and_stop
#[tokio::test(start_paused = true)]
async fn test_background_tasks_deliver_and_stop() {
    let h = gateway_harness(config(), MockTransport::with_behavior(OpenBehavior::AutoOpen));
    let id = instance("a");
    let access = h.gateway.authorize("acme-token", &id).await.unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = h.gateway.spawn_background(shutdown_rx);

    h.gateway.enqueue_send(&access, text(1)).await.unwrap();
    h.gateway.connect(&access).await.unwrap();
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(h.transport.sent().len(), 1);

    shutdown_tx.send(true).unwrap();
    for handle in handles {
        handle.await.unwrap();
    }
    h.gateway.shutdown().await;
    assert_eq!(h.transport.live_sessions(&id), 0);
}

/// Test: stop_lets_in_flight_send_finish
///
/// Sessions are closed only after the drain loop has finished its current
/// send
#[tokio::test(start_paused = true)]
async fn test_stop_lets_in_flight_send_finish() {
    let h = gateway_harness(config(), MockTransport::with_behavior(OpenBehavior::AutoOpen));
    let id = instance("a");
    let access = h.gateway.authorize("acme-token", &id).await.unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = h.gateway.spawn_background(shutdown_rx);

    h.gateway.connect(&access).await.unwrap();
    settle().await;
    h.transport.set_send_delay(Duration::from_secs(1));
    h.gateway.enqueue_send(&access, text(1)).await.unwrap();

    // Drain tick at 2s starts a send that completes at 3s
    tokio::time::sleep(Duration::from_millis(2_500)).await;
    assert!(h.transport.sent().is_empty());
    assert_eq!(h.gateway.queue_status(&access).main_queue, 0);

    shutdown_tx.send(true).unwrap();
    h.gateway.stop(handles).await;

    assert_eq!(h.transport.sent().len(), 1);
    assert_eq!(h.transport.live_sessions(&id), 0);
    assert_eq!(h.gateway.queue().totals().sent, 1);
}
