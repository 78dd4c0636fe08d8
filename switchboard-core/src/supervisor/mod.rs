//! Connection Supervisor
//!
//! Owns every instance's transport connection. For each instance it
//! enforces:
//!
//! - at most one connection in Connecting or Open at any time
//! - circuit breaker and conflict cooldown checks before each attempt
//! - linear backoff once an instance has retried too often
//! - full teardown of the previous connection before a new one opens
//!
//! Transport events are pumped by one task per connection and dispatched to
//! the handlers in `events.rs`. Reconnection is deferred through the
//! [`RetryScheduler`], which keeps at most one timer per instance.

mod events;
mod instance;

pub use instance::{CircuitStatus, ConnectionHandle};

use crate::config::SupervisorConfig;
use crate::core::connection_fsm::InstanceStatus;
use crate::core::errors::{QrWaitError, SendError, TransportError, UnavailableReason};
use crate::core::types::{InstanceId, MessagePayload};
use crate::monitoring::{ConnectionMetrics, MetricsRegistry};
use crate::persistence::PersistenceSink;
use crate::queue::DeliveryTarget;
use crate::resilience::{BreakerCheck, LinearBackoff, RetryScheduler};
use crate::transport::{Transport, TransportConnection, TransportSession};
use async_trait::async_trait;
use dashmap::DashMap;
use instance::{effective_status, InstanceConnectionState, LiveConnection};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

type InstanceSlot = Arc<Mutex<InstanceConnectionState>>;

/// Result of a connect request. Connection problems are values, not errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// A new connection was opened and is waiting for the transport handshake
    Started(ConnectionHandle),
    /// An attempt is already Connecting or Open; nothing was started
    AlreadyInProgress(ConnectionHandle),
    Unavailable(UnavailableReason),
}

impl ConnectOutcome {
    pub fn is_started(&self) -> bool {
        matches!(self, ConnectOutcome::Started(_))
    }

    pub fn handle(&self) -> Option<&ConnectionHandle> {
        match self {
            ConnectOutcome::Started(h) | ConnectOutcome::AlreadyInProgress(h) => Some(h),
            ConnectOutcome::Unavailable(_) => None,
        }
    }
}

/// Work done by one [`ConnectionSupervisor::sweep`] pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Attempts stuck in Connecting that were torn down
    pub stale_connecting: usize,
    /// Unpaired instances logged out after their pairing code expired
    pub expired_pairings: usize,
}

struct SupervisorInner {
    config: SupervisorConfig,
    transport: Arc<dyn Transport>,
    persistence: Arc<dyn PersistenceSink>,
    metrics: Arc<MetricsRegistry>,
    instances: DashMap<InstanceId, InstanceSlot>,
    /// Serializes persistence writes per instance. Outlives the slot, which
    /// logout removes.
    storage_locks: DashMap<InstanceId, Arc<tokio::sync::Mutex<()>>>,
    backoff: LinearBackoff,
    scheduler: RetryScheduler,
    shutting_down: AtomicBool,
}

/// Cheap to clone; all clones share the same instances
#[derive(Clone)]
pub struct ConnectionSupervisor {
    inner: Arc<SupervisorInner>,
}

impl ConnectionSupervisor {
    pub fn new(
        config: SupervisorConfig,
        transport: Arc<dyn Transport>,
        persistence: Arc<dyn PersistenceSink>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        info!(?config, "Creating connection supervisor");
        Self {
            inner: Arc::new(SupervisorInner {
                backoff: LinearBackoff::new(config.backoff()),
                scheduler: RetryScheduler::new(config.max_network_timeouts),
                config,
                transport,
                persistence,
                metrics,
                instances: DashMap::new(),
                storage_locks: DashMap::new(),
                shutting_down: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.inner.config
    }

    pub fn metrics(&self) -> &ConnectionMetrics {
        self.inner.metrics.connection()
    }

    /// Start a connection for `instance_id`.
    ///
    /// Refuses without side effects when an attempt is already live, the
    /// circuit breaker is open, or a conflict happened within the
    /// suppression window. Otherwise records the attempt, backs off if the
    /// instance has retried too often, tears down any previous connection
    /// and opens a new one.
    pub async fn connect(&self, instance_id: &InstanceId) -> ConnectOutcome {
        if self.inner.shutting_down.load(Ordering::Acquire) {
            return ConnectOutcome::Unavailable(UnavailableReason::ShuttingDown);
        }

        let slot = self.slot(instance_id);
        let metrics = self.metrics();
        let now = Instant::now();

        let (generation, backoff, previous, mut cleanup_rx) = {
            let mut state = slot.lock();

            if state.status().is_live() {
                debug!(
                    instance = %instance_id,
                    status = %state.status(),
                    "Connection already in progress"
                );
                return ConnectOutcome::AlreadyInProgress(state.handle());
            }

            match state.breaker.poll(now) {
                BreakerCheck::Open { remaining } => {
                    state.move_to(InstanceStatus::CircuitOpen, now, metrics);
                    metrics
                        .connect_rejected_total
                        .with_label_values(&["circuit_open"])
                        .inc();
                    warn!(
                        instance = %instance_id,
                        remaining_secs = remaining.as_secs(),
                        "Circuit breaker open, refusing connect"
                    );
                    return ConnectOutcome::Unavailable(UnavailableReason::CircuitOpen { remaining });
                }
                BreakerCheck::Reset => {
                    info!(instance = %instance_id, "Circuit breaker cooldown elapsed, clearing retry count");
                    state.retry_count = 0;
                }
                BreakerCheck::Closed => {}
            }

            if let Some(remaining) =
                state.conflict_cooldown_remaining(now, self.inner.config.conflict_suppression())
            {
                metrics
                    .connect_rejected_total
                    .with_label_values(&["conflict_cooldown"])
                    .inc();
                warn!(
                    instance = %instance_id,
                    remaining_secs = remaining.as_secs(),
                    "Recent conflict, refusing connect"
                );
                return ConnectOutcome::Unavailable(UnavailableReason::ConflictCooldown { remaining });
            }

            let backoff = self.inner.backoff.delay_before_attempt(state.retry_count);
            state.retry_count += 1;
            let generation = state.begin_attempt(now, metrics);
            info!(
                instance = %instance_id,
                generation,
                retry_count = state.retry_count,
                "Starting connection attempt"
            );

            (
                generation,
                backoff,
                state.connection.take(),
                state.cleanup.subscribe(),
            )
        };

        metrics.connect_attempts_total.inc();

        if let Some(delay) = backoff {
            info!(
                instance = %instance_id,
                delay_secs = delay.as_secs(),
                "Backing off before connect"
            );
            tokio::time::sleep(delay).await;
        }

        if let Some(previous) = previous {
            self.teardown(&slot, instance_id, previous, self.inner.config.cleanup_settle())
                .await;
        }

        let cleaned = cleanup_rx.wait_for(|in_flight| *in_flight == 0).await.is_ok();
        if !cleaned || !self.is_current(&slot, generation) {
            debug!(instance = %instance_id, generation, "Attempt superseded before open");
            return ConnectOutcome::Unavailable(UnavailableReason::Superseded);
        }

        let credentials = match self.inner.persistence.load_credentials(instance_id).await {
            Ok(credentials) => credentials,
            Err(e) => {
                warn!(instance = %instance_id, error = %e, "Failed to load stored credentials, pairing from scratch");
                None
            }
        };

        match self.inner.transport.open(instance_id, credentials).await {
            Ok(connection) => match self.install(&slot, instance_id, generation, connection) {
                Ok(handle) => ConnectOutcome::Started(handle),
                Err(orphan) => {
                    orphan.close().await;
                    ConnectOutcome::Unavailable(UnavailableReason::Superseded)
                }
            },
            Err(err) => {
                warn!(instance = %instance_id, error = %err, "Transport failed to open");
                self.on_disconnect(&slot, instance_id, generation, err.disconnect_reason())
                    .await;
                ConnectOutcome::Unavailable(UnavailableReason::OpenFailed {
                    message: err.to_string(),
                })
            }
        }
    }

    /// Store a freshly opened connection and start pumping its events.
    ///
    /// Hands the session back if the attempt was superseded while opening.
    fn install(
        &self,
        slot: &InstanceSlot,
        instance_id: &InstanceId,
        generation: u64,
        connection: TransportConnection,
    ) -> Result<ConnectionHandle, Arc<dyn TransportSession>> {
        let TransportConnection { session, events } = connection;

        let handle = {
            let mut state = slot.lock();
            if !state.is_current(generation) || state.status() != InstanceStatus::Connecting {
                return Err(session);
            }
            state.connection = Some(LiveConnection {
                session,
                generation,
            });
            state.handle()
        };

        self.spawn_event_pump(instance_id.clone(), generation, events);
        Ok(handle)
    }

    /// Clear the breaker, retry count and network timeout streak, then connect.
    pub async fn force_retry(&self, instance_id: &InstanceId) -> ConnectOutcome {
        let slot = self.slot(instance_id);
        {
            let mut state = slot.lock();
            if state.status().is_live() {
                info!(instance = %instance_id, "Force retry skipped, session already active");
                return ConnectOutcome::AlreadyInProgress(state.handle());
            }

            info!(instance = %instance_id, "Force retry: resetting circuit breaker and counters");
            state.reset_counters();
            state.retry.cancel_pending();
            self.inner
                .scheduler
                .reset_network_timeout_counter(&mut state.retry, instance_id);
            if state.status() == InstanceStatus::CircuitOpen {
                state.move_to(InstanceStatus::Idle, Instant::now(), self.metrics());
            }
        }

        self.connect(instance_id).await
    }

    /// Clear the breaker and retry count without connecting.
    ///
    /// Returns false if the instance is unknown.
    pub fn reset_circuit_breaker(&self, instance_id: &InstanceId) -> bool {
        let Some(slot) = self.existing_slot(instance_id) else {
            return false;
        };

        let mut state = slot.lock();
        state.reset_counters();
        if state.status() == InstanceStatus::CircuitOpen {
            state.move_to(InstanceStatus::Idle, Instant::now(), self.metrics());
        }
        info!(instance = %instance_id, "Circuit breaker reset");
        true
    }

    /// Close the connection, discard stored credentials and forget the instance
    pub async fn logout(&self, instance_id: &InstanceId) {
        if let Some(slot) = self.existing_slot(instance_id) {
            let previous = {
                let mut state = slot.lock();
                state.retry.cancel_pending();
                state.invalidate();
                state.move_to(InstanceStatus::Idle, Instant::now(), self.metrics());
                state.clear_qr();
                state.connection.take()
            };

            if let Some(previous) = previous {
                self.teardown(&slot, instance_id, previous, Duration::ZERO)
                    .await;
            }
            self.remove(instance_id);
        }

        let lock = self.storage_lock(instance_id);
        let _storage = lock.lock().await;
        if let Err(e) = self.inner.persistence.delete_session(instance_id).await {
            warn!(instance = %instance_id, error = %e, "Failed to delete stored session");
        }
        info!(instance = %instance_id, "Instance logged out");
    }

    /// Send over the instance's open connection
    pub async fn send(
        &self,
        instance_id: &InstanceId,
        payload: &MessagePayload,
    ) -> Result<(), SendError> {
        let session = {
            let slot = self
                .existing_slot(instance_id)
                .ok_or(SendError::NotConnected)?;
            let state = slot.lock();
            match &state.connection {
                Some(conn) if state.status() == InstanceStatus::Open => conn.session.clone(),
                _ => return Err(SendError::NotConnected),
            }
        };

        session.send(payload).await.map_err(|e| match e {
            TransportError::NotConnected => SendError::NotConnected,
            other => SendError::Transport(other),
        })
    }

    pub fn is_open(&self, instance_id: &InstanceId) -> bool {
        self.existing_slot(instance_id).is_some_and(|slot| {
            let state = slot.lock();
            state.status() == InstanceStatus::Open && state.connection.is_some()
        })
    }

    /// Effective status, or `None` for an unknown instance
    pub fn status(&self, instance_id: &InstanceId) -> Option<InstanceStatus> {
        let slot = self.existing_slot(instance_id)?;
        let state = slot.lock();
        Some(effective_status(
            state.status(),
            state.breaker.is_open_at(Instant::now()),
        ))
    }

    pub fn circuit_status(&self, instance_id: &InstanceId) -> Option<CircuitStatus> {
        let slot = self.existing_slot(instance_id)?;
        let status = slot
            .lock()
            .snapshot(Instant::now(), &self.inner.config, &self.inner.scheduler);
        Some(status)
    }

    pub fn circuit_statuses(&self) -> Vec<CircuitStatus> {
        let now = Instant::now();
        self.slots()
            .into_iter()
            .map(|(_, slot)| {
                let state = slot.lock();
                state.snapshot(now, &self.inner.config, &self.inner.scheduler)
            })
            .collect()
    }

    pub fn instance_ids(&self) -> Vec<InstanceId> {
        self.inner
            .instances
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Wait for a pairing code.
    ///
    /// Resolves with the latest code, or fails if the instance opens without
    /// one, goes back to Idle, is removed, or `timeout` elapses.
    pub async fn wait_for_qr(
        &self,
        instance_id: &InstanceId,
        timeout: Duration,
    ) -> Result<String, QrWaitError> {
        let (mut qr_rx, mut status_rx) = {
            let slot = self
                .existing_slot(instance_id)
                .ok_or(QrWaitError::SessionLost)?;
            let state = slot.lock();
            (state.qr_tx.subscribe(), state.status_tx.subscribe())
        };

        let wait = async {
            let mut status_changed = false;
            loop {
                let code = qr_rx.borrow_and_update().clone();
                if let Some(code) = code {
                    return Ok(code);
                }

                let status = *status_rx.borrow_and_update();
                match status {
                    InstanceStatus::Open => return Err(QrWaitError::AlreadyPaired),
                    InstanceStatus::Idle if status_changed => return Err(QrWaitError::SessionLost),
                    _ => {}
                }

                tokio::select! {
                    changed = qr_rx.changed() => changed.map_err(|_| QrWaitError::SessionLost)?,
                    changed = status_rx.changed() => {
                        changed.map_err(|_| QrWaitError::SessionLost)?;
                        status_changed = true;
                    }
                }
            }
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => {
                warn!(instance = %instance_id, timeout_secs = timeout.as_secs(), "No pairing code issued in time");
                Err(QrWaitError::Timeout(timeout))
            }
        }
    }

    /// Wait until the instance is Open. Returns false on timeout or removal.
    pub async fn wait_until_open(&self, instance_id: &InstanceId, timeout: Duration) -> bool {
        let Some(mut status_rx) = self
            .existing_slot(instance_id)
            .map(|slot| {
                let state = slot.lock();
                state.status_tx.subscribe()
            })
        else {
            return false;
        };

        let opened = tokio::time::timeout(
            timeout,
            status_rx.wait_for(|status| *status == InstanceStatus::Open),
        )
        .await;
        matches!(opened, Ok(Ok(_)))
    }

    /// Tear down attempts stuck in Connecting and log out unpaired instances
    /// whose pairing code has expired.
    pub async fn sweep(&self) -> SweepReport {
        let now = Instant::now();
        let stale_after = self.inner.config.stale_connecting();
        let qr_ttl = self.inner.config.qr_session_ttl();

        let mut expired = Vec::new();
        let mut stale = Vec::new();
        for (id, slot) in self.slots() {
            let state = slot.lock();
            let qr_expired = state.status() != InstanceStatus::Open
                && state
                    .qr_issued_at
                    .is_some_and(|at| now.saturating_duration_since(at) >= qr_ttl);

            if qr_expired {
                expired.push(id);
            } else if state.status() == InstanceStatus::Connecting
                && state.lifecycle().time_in_state(now) >= stale_after
            {
                stale.push((id, slot.clone()));
            }
        }

        let mut report = SweepReport::default();

        for (id, slot) in stale {
            if self.abandon_stale(&slot, &id).await {
                report.stale_connecting += 1;
            }
        }

        for id in expired {
            info!(instance = %id, "Pairing code expired without a scan, logging out");
            self.logout(&id).await;
            report.expired_pairings += 1;
        }

        if report != SweepReport::default() {
            info!(?report, "Sweep finished");
        }
        report
    }

    async fn abandon_stale(&self, slot: &InstanceSlot, instance_id: &InstanceId) -> bool {
        let now = Instant::now();
        let previous = {
            let mut state = slot.lock();
            if state.status() != InstanceStatus::Connecting {
                return false;
            }
            if state.breaker.record_failure(now) {
                self.metrics().breaker_trips_total.inc();
            }
            state.invalidate();
            state.move_to(InstanceStatus::Idle, now, self.metrics());
            state.connection.take()
        };

        warn!(instance = %instance_id, "Connection stuck in Connecting, tearing it down");
        if let Some(previous) = previous {
            self.teardown(slot, instance_id, previous, Duration::ZERO)
                .await;
        }
        true
    }

    /// Cancel all pending retries and close every connection.
    ///
    /// Later connect requests are refused.
    pub async fn shutdown(&self) {
        self.inner.shutting_down.store(true, Ordering::Release);
        let now = Instant::now();

        let mut closing = Vec::new();
        for (id, slot) in self.slots() {
            let previous = {
                let mut state = slot.lock();
                state.retry.cancel_pending();
                state.invalidate();
                state.move_to(InstanceStatus::Idle, now, self.metrics());
                state.connection.take()
            };
            if let Some(previous) = previous {
                closing.push((id, slot, previous));
            }
        }

        let closed = closing.len();
        for (id, slot, previous) in closing {
            self.teardown(&slot, &id, previous, Duration::ZERO).await;
        }
        info!(closed, "Connection supervisor shut down");
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::Acquire)
    }

    /// Close a session with the cleanup counter raised, then wait `settle`
    async fn teardown(
        &self,
        slot: &InstanceSlot,
        instance_id: &InstanceId,
        connection: LiveConnection,
        settle: Duration,
    ) {
        slot.lock().cleanup.send_modify(|in_flight| *in_flight += 1);
        debug!(
            instance = %instance_id,
            generation = connection.generation,
            "Tearing down session"
        );

        connection.session.close().await;
        if !settle.is_zero() {
            tokio::time::sleep(settle).await;
        }

        slot.lock()
            .cleanup
            .send_modify(|in_flight| *in_flight = in_flight.saturating_sub(1));
        debug!(instance = %instance_id, "Session cleaned up");
    }

    fn slot(&self, instance_id: &InstanceId) -> InstanceSlot {
        let entry = self
            .inner
            .instances
            .entry(instance_id.clone())
            .or_insert_with(|| {
                Arc::new(Mutex::new(InstanceConnectionState::new(
                    instance_id.clone(),
                    &self.inner.config,
                    self.metrics(),
                    Instant::now(),
                )))
            });
        Arc::clone(entry.value())
    }

    fn storage_lock(&self, instance_id: &InstanceId) -> Arc<tokio::sync::Mutex<()>> {
        let entry = self
            .inner
            .storage_locks
            .entry(instance_id.clone())
            .or_default();
        Arc::clone(entry.value())
    }

    /// Whether `generation` is still the instance's current attempt
    fn is_current_generation(&self, instance_id: &InstanceId, generation: u64) -> bool {
        self.existing_slot(instance_id).is_some_and(|slot| {
            let state = slot.lock();
            state.is_current(generation)
        })
    }

    fn existing_slot(&self, instance_id: &InstanceId) -> Option<InstanceSlot> {
        self.inner
            .instances
            .get(instance_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Snapshot of all slots so no map lock is held while locking an instance
    fn slots(&self) -> Vec<(InstanceId, InstanceSlot)> {
        self.inner
            .instances
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect()
    }

    fn remove(&self, instance_id: &InstanceId) {
        if let Some((_, slot)) = self.inner.instances.remove(instance_id) {
            let status = slot.lock().status();
            self.metrics()
                .instances_by_status
                .with_label_values(&[status.state_name()])
                .dec();
        }
    }

    fn is_current(&self, slot: &InstanceSlot, generation: u64) -> bool {
        slot.lock().is_current(generation)
    }
}

#[async_trait]
impl DeliveryTarget for ConnectionSupervisor {
    fn is_ready(&self, instance_id: &InstanceId) -> bool {
        self.is_open(instance_id)
    }

    async fn send(
        &self,
        instance_id: &InstanceId,
        payload: &MessagePayload,
    ) -> Result<(), SendError> {
        ConnectionSupervisor::send(self, instance_id, payload).await
    }
}
