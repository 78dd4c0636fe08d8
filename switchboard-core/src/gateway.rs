//! Tenant-facing facade
//!
//! Checks access tokens and instance ownership against the
//! [`TenantDirectory`], then delegates to the supervisor and delivery
//! queue. Tenant operations take an [`Access`], which can only be obtained
//! from [`Gateway::authorize`]. Operator operations take a bare instance id.

use crate::config::{Config, SupervisorConfig};
use crate::core::connection_fsm::InstanceStatus;
use crate::core::errors::GatewayError;
use crate::core::types::{InstanceId, MessageId, MessagePayload};
use crate::directory::{Tenant, TenantDirectory};
use crate::monitoring::MetricsRegistry;
use crate::persistence::PersistenceSink;
use crate::queue::{DeliveryQueue, QueueStatus};
use crate::resilience::{HealthReporter, HealthSnapshot};
use crate::supervisor::{CircuitStatus, ConnectOutcome, ConnectionHandle, ConnectionSupervisor};
use crate::transport::Transport;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Proof that a token may act on an instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Access {
    tenant: Tenant,
    instance_id: InstanceId,
}

impl Access {
    pub fn tenant(&self) -> &Tenant {
        &self.tenant
    }

    pub fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }
}

#[derive(Clone)]
pub struct Gateway {
    config: SupervisorConfig,
    supervisor: ConnectionSupervisor,
    queue: DeliveryQueue,
    directory: Arc<dyn TenantDirectory>,
    persistence: Arc<dyn PersistenceSink>,
    reporter: HealthReporter,
}

impl Gateway {
    pub fn new(
        config: &Config,
        transport: Arc<dyn Transport>,
        persistence: Arc<dyn PersistenceSink>,
        directory: Arc<dyn TenantDirectory>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        let supervisor = ConnectionSupervisor::new(
            config.supervisor.clone(),
            transport,
            persistence.clone(),
            metrics.clone(),
        );
        let queue = DeliveryQueue::new(
            config.queue.clone(),
            Arc::new(supervisor.clone()),
            metrics,
        );
        let reporter = HealthReporter::new(supervisor.clone(), queue.clone());

        Self {
            config: config.supervisor.clone(),
            supervisor,
            queue,
            directory,
            persistence,
            reporter,
        }
    }

    pub fn supervisor(&self) -> &ConnectionSupervisor {
        &self.supervisor
    }

    pub fn queue(&self) -> &DeliveryQueue {
        &self.queue
    }

    pub fn reporter(&self) -> &HealthReporter {
        &self.reporter
    }

    /// Resolve `token` and check that it owns `instance_id`
    pub async fn authorize(
        &self,
        token: &str,
        instance_id: &InstanceId,
    ) -> Result<Access, GatewayError> {
        let tenant = self
            .directory
            .resolve_token(token)
            .await?
            .ok_or(GatewayError::Unauthorized)?;

        if self
            .directory
            .resolve_instance(&tenant.id, instance_id)
            .await?
            .is_none()
        {
            debug!(tenant = %tenant.id, instance = %instance_id, "Instance not owned by tenant");
            return Err(GatewayError::InstanceInvalidated(instance_id.clone()));
        }

        Ok(Access {
            tenant,
            instance_id: instance_id.clone(),
        })
    }

    pub async fn connect(&self, access: &Access) -> Result<ConnectionHandle, GatewayError> {
        match self.supervisor.connect(&access.instance_id).await {
            ConnectOutcome::Started(handle) | ConnectOutcome::AlreadyInProgress(handle) => Ok(handle),
            ConnectOutcome::Unavailable(reason) => Err(GatewayError::Unavailable(reason)),
        }
    }

    /// Queue a message for delivery once the instance is open
    pub async fn enqueue_send(
        &self,
        access: &Access,
        payload: MessagePayload,
    ) -> Result<MessageId, GatewayError> {
        let tenant_id = &access.tenant.id;
        if !self.directory.try_consume_quota(tenant_id).await? {
            warn!(tenant = %tenant_id, "Monthly quota exceeded");
            return Err(GatewayError::QuotaExceeded);
        }

        match self.queue.enqueue(&access.instance_id, payload) {
            Ok(message_id) => Ok(message_id),
            Err(e) => {
                if let Err(refund) = self.directory.refund_quota(tenant_id).await {
                    warn!(tenant = %tenant_id, error = %refund, "Failed to refund quota");
                }
                Err(e.into())
            }
        }
    }

    /// Get a pairing code, starting a connection if none is live.
    ///
    /// An open breaker is reset first: asking for a code is an explicit
    /// operator action.
    pub async fn qr_code(&self, access: &Access) -> Result<String, GatewayError> {
        let instance_id = &access.instance_id;

        if self.supervisor.status(instance_id) == Some(InstanceStatus::CircuitOpen) {
            info!(instance = %instance_id, "Resetting circuit breaker for pairing request");
            self.supervisor.reset_circuit_breaker(instance_id);
        }

        let live = self
            .supervisor
            .status(instance_id)
            .is_some_and(InstanceStatus::is_live);
        if !live {
            if let ConnectOutcome::Unavailable(reason) = self.supervisor.connect(instance_id).await {
                return Err(GatewayError::Unavailable(reason));
            }
        }

        let code = self
            .supervisor
            .wait_for_qr(instance_id, self.config.qr_wait_timeout())
            .await?;
        Ok(code)
    }

    /// Close the connection, forget stored credentials and drop queued messages
    pub async fn logout(&self, access: &Access) {
        self.supervisor.logout(&access.instance_id).await;
        self.queue.clear_instance(&access.instance_id);
    }

    pub fn queue_status(&self, access: &Access) -> QueueStatus {
        self.queue.status(&access.instance_id)
    }

    pub fn circuit_status(&self, access: &Access) -> Option<CircuitStatus> {
        self.supervisor.circuit_status(&access.instance_id)
    }

    pub async fn force_retry(&self, instance_id: &InstanceId) -> ConnectOutcome {
        self.supervisor.force_retry(instance_id).await
    }

    pub fn reset_circuit_breaker(&self, instance_id: &InstanceId) -> bool {
        self.supervisor.reset_circuit_breaker(instance_id)
    }

    pub fn health_snapshot(&self) -> HealthSnapshot {
        self.reporter.snapshot()
    }

    /// Reconnect instances that have stored credentials. Returns how many
    /// connections were started.
    pub async fn restore_sessions(&self, instance_ids: &[InstanceId]) -> usize {
        let mut started = 0;
        for instance_id in instance_ids {
            match self.persistence.load_credentials(instance_id).await {
                Ok(Some(_)) => {
                    if self.supervisor.connect(instance_id).await.is_started() {
                        started += 1;
                    }
                }
                Ok(None) => debug!(instance = %instance_id, "No stored session"),
                Err(e) => warn!(instance = %instance_id, error = %e, "Failed to read stored session"),
            }
        }
        info!(started, "Stored sessions restored");
        started
    }

    /// Start the drain processor and the periodic sweep
    pub fn spawn_background(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        vec![
            self.queue.spawn_processor(shutdown.clone()),
            self.spawn_sweeper(shutdown),
        ]
    }

    fn spawn_sweeper(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let supervisor = self.supervisor.clone();
        let every = self.config.sweep_interval();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            // First tick fires immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        supervisor.sweep().await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("Sweeper stopped");
        })
    }

    pub async fn shutdown(&self) {
        self.supervisor.shutdown().await;
    }

    /// Wait for the tasks from [`Gateway::spawn_background`] to finish, then
    /// close every session. Their shutdown flag must already be set.
    pub async fn stop(&self, tasks: Vec<JoinHandle<()>>) {
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task failed");
            }
        }
        self.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::errors::UnavailableReason;
    use crate::testing::{gateway_harness, instance, test_tenants, text, MockTransport};

    fn config() -> Config {
        Config {
            tenants: test_tenants(),
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn test_authorize() {
        let h = gateway_harness(config(), MockTransport::new());

        let access = h.gateway.authorize("acme-token", &instance("a")).await.unwrap();
        assert_eq!(access.tenant().id, "acme");
        assert_eq!(access.instance_id(), &instance("a"));

        assert!(matches!(
            h.gateway.authorize("nope", &instance("a")).await,
            Err(GatewayError::Unauthorized)
        ));
        assert!(matches!(
            h.gateway.authorize("acme-token", &instance("z")).await,
            Err(GatewayError::InstanceInvalidated(_))
        ));
    }

    #[tokio::test]
    async fn test_quota_checked_before_enqueue() {
        let mut config = config();
        config.tenants[0].monthly_limit = Some(2);
        let h = gateway_harness(config, MockTransport::new());
        let access = h.gateway.authorize("acme-token", &instance("a")).await.unwrap();

        h.gateway.enqueue_send(&access, text(1)).await.unwrap();
        h.gateway.enqueue_send(&access, text(2)).await.unwrap();
        assert!(matches!(
            h.gateway.enqueue_send(&access, text(3)).await,
            Err(GatewayError::QuotaExceeded)
        ));
        assert_eq!(h.gateway.queue_status(&access).main_queue, 2);
        assert_eq!(h.directory.usage("acme"), 2);
    }

    #[tokio::test]
    async fn test_rejected_enqueue_refunds_quota() {
        let mut config = config();
        config.queue.max_queue_size = 1;
        let h = gateway_harness(config, MockTransport::new());
        let access = h.gateway.authorize("acme-token", &instance("a")).await.unwrap();

        h.gateway.enqueue_send(&access, text(1)).await.unwrap();
        assert!(matches!(
            h.gateway.enqueue_send(&access, text(2)).await,
            Err(GatewayError::Queue(_))
        ));
        assert_eq!(h.directory.usage("acme"), 1);
    }

    #[tokio::test]
    async fn test_connect_refused_after_shutdown() {
        let h = gateway_harness(config(), MockTransport::new());
        let access = h.gateway.authorize("acme-token", &instance("a")).await.unwrap();

        h.gateway.shutdown().await;
        assert!(matches!(
            h.gateway.connect(&access).await,
            Err(GatewayError::Unavailable(UnavailableReason::ShuttingDown))
        ));
    }
}
