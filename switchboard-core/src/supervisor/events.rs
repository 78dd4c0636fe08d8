//! Transport event handling and retry scheduling
//!
//! Every handler first checks that the event belongs to the instance's
//! current attempt. Events from a superseded connection, or arriving while
//! that connection is already being torn down, are dropped.

use super::instance::InstanceConnectionState;
use super::{ConnectOutcome, ConnectionSupervisor, InstanceSlot};
use crate::core::connection_fsm::InstanceStatus;
use crate::core::errors::{DisconnectReason, UnavailableReason};
use crate::core::types::InstanceId;
use crate::resilience::ScheduleOutcome;
use crate::transport::{TransportEvent, UserInfo};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

impl ConnectionSupervisor {
    pub(super) fn spawn_event_pump(
        &self,
        instance_id: InstanceId,
        generation: u64,
        mut events: mpsc::Receiver<TransportEvent>,
    ) {
        let supervisor = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                supervisor.handle_event(&instance_id, generation, event).await;
            }

            // A stream that ends without a close event still means the
            // connection is gone
            debug!(instance = %instance_id, generation, "Transport event stream ended");
            supervisor.handle_stream_end(&instance_id, generation).await;
        });
    }

    async fn handle_event(&self, instance_id: &InstanceId, generation: u64, event: TransportEvent) {
        let Some(slot) = self.existing_slot(instance_id) else {
            return;
        };

        let current = slot.lock().is_current(generation);
        if !current {
            debug!(instance = %instance_id, generation, "Ignoring event from superseded connection");
            return;
        }

        match event {
            TransportEvent::Opened(user) => self.on_opened(&slot, instance_id, generation, user).await,
            TransportEvent::Closed(reason) => {
                self.on_disconnect(&slot, instance_id, generation, reason)
                    .await
            }
            TransportEvent::Conflict => {
                self.on_disconnect(&slot, instance_id, generation, DisconnectReason::ProtocolConflict)
                    .await
            }
            TransportEvent::LoggedOut => {
                self.on_disconnect(&slot, instance_id, generation, DisconnectReason::SessionInvalidated)
                    .await
            }
            TransportEvent::QrCodeIssued(code) => {
                let mut state = slot.lock();
                if state.status() == InstanceStatus::Connecting {
                    state.set_qr(code, Instant::now());
                    info!(instance = %instance_id, "Pairing code issued");
                }
            }
            TransportEvent::CredentialsUpdated(credentials) => {
                // Checked again under the storage lock so a save can never
                // land after a logout deleted the session
                let lock = self.storage_lock(instance_id);
                let _storage = lock.lock().await;
                if !self.is_current_generation(instance_id, generation) {
                    debug!(instance = %instance_id, generation, "Dropping credentials from superseded connection");
                    return;
                }
                if let Err(e) = self
                    .inner
                    .persistence
                    .save_credentials(instance_id, &credentials)
                    .await
                {
                    error!(instance = %instance_id, error = %e, "Failed to persist credentials");
                }
            }
        }
    }

    async fn handle_stream_end(&self, instance_id: &InstanceId, generation: u64) {
        if let Some(slot) = self.existing_slot(instance_id) {
            let reason = DisconnectReason::TransientDisconnect {
                code: None,
                message: "event stream ended".to_string(),
            };
            self.on_disconnect(&slot, instance_id, generation, reason)
                .await;
        }
    }

    async fn on_opened(
        &self,
        slot: &InstanceSlot,
        instance_id: &InstanceId,
        generation: u64,
        user: UserInfo,
    ) {
        {
            let mut state = slot.lock();
            if !state.is_current(generation) || state.status() != InstanceStatus::Connecting {
                return;
            }

            state.move_to(InstanceStatus::Open, Instant::now(), self.metrics());
            state.reset_counters();
            state.last_conflict = None;
            state.retry.cancel_pending();
            self.inner
                .scheduler
                .reset_network_timeout_counter(&mut state.retry, instance_id);
            state.clear_qr();
            state.user = Some(user.clone());
        }

        info!(instance = %instance_id, user = %user.id, "Connection open");

        let lock = self.storage_lock(instance_id);
        let _storage = lock.lock().await;
        if !self.is_current_generation(instance_id, generation) {
            return;
        }
        if let Err(e) = self.inner.persistence.save_account(instance_id, &user).await {
            error!(instance = %instance_id, error = %e, "Failed to persist account");
        }
    }

    /// Route a lost connection (or failed open) by its classification
    pub(super) async fn on_disconnect(
        &self,
        slot: &InstanceSlot,
        instance_id: &InstanceId,
        generation: u64,
        reason: DisconnectReason,
    ) {
        match reason {
            DisconnectReason::ProtocolConflict => {
                self.on_conflict(slot, instance_id, generation).await
            }
            DisconnectReason::SessionInvalidated => {
                self.on_logged_out(slot, instance_id, generation).await
            }
            DisconnectReason::NetworkTimeout | DisconnectReason::TransientDisconnect { .. } => {
                self.on_closed(slot, instance_id, generation, reason).await
            }
        }
    }

    /// Network timeout or transient close: count a failure and retry later
    async fn on_closed(
        &self,
        slot: &InstanceSlot,
        instance_id: &InstanceId,
        generation: u64,
        reason: DisconnectReason,
    ) {
        let now = Instant::now();
        let previous = {
            let mut state = slot.lock();
            if !self.claim_disconnect(&state, generation) {
                return;
            }
            self.record_failure(&mut state, &reason, now);
            state.move_to(InstanceStatus::ClosingRetry, now, self.metrics());
            state.connection.take()
        };

        warn!(instance = %instance_id, %reason, "Connection closed");

        if let Some(previous) = previous {
            self.teardown(slot, instance_id, previous, Duration::ZERO)
                .await;
        }

        let config = &self.inner.config;
        let (delay, is_network_timeout) = if reason.is_network_timeout() {
            (config.timeout_retry_delay(), true)
        } else {
            (config.transient_retry_delay(), false)
        };
        self.schedule_retry(
            slot,
            instance_id,
            generation,
            delay,
            reason.label(),
            is_network_timeout,
        );
    }

    /// Another client took the account. Queued messages stay put; the
    /// instance waits out the suppression window before reconnecting.
    async fn on_conflict(&self, slot: &InstanceSlot, instance_id: &InstanceId, generation: u64) {
        let now = Instant::now();
        let previous = {
            let mut state = slot.lock();
            if !self.claim_disconnect(&state, generation) {
                return;
            }
            state.last_conflict = Some(now);
            self.metrics().conflicts_total.inc();
            self.record_failure(&mut state, &DisconnectReason::ProtocolConflict, now);
            state.move_to(InstanceStatus::ConflictCooldown, now, self.metrics());
            state.connection.take()
        };

        warn!(
            instance = %instance_id,
            "Conflict: another client took over this account. Close other sessions for this number; queued messages are kept"
        );

        if let Some(previous) = previous {
            self.teardown(slot, instance_id, previous, self.inner.config.conflict_settle())
                .await;
        }

        self.schedule_retry(
            slot,
            instance_id,
            generation,
            self.inner.config.conflict_retry_delay(),
            DisconnectReason::ProtocolConflict.label(),
            false,
        );
    }

    /// Server revoked the session: drop credentials and stop retrying
    async fn on_logged_out(&self, slot: &InstanceSlot, instance_id: &InstanceId, generation: u64) {
        let previous = {
            let mut state = slot.lock();
            if !self.claim_disconnect(&state, generation) {
                return;
            }
            self.metrics()
                .disconnects_total
                .with_label_values(&[DisconnectReason::SessionInvalidated.label()])
                .inc();
            state.reset_counters();
            state.last_conflict = None;
            state.retry.cancel_pending();
            self.inner
                .scheduler
                .reset_network_timeout_counter(&mut state.retry, instance_id);
            state.invalidate();
            state.move_to(InstanceStatus::Idle, Instant::now(), self.metrics());
            state.clear_qr();
            state.user = None;
            state.connection.take()
        };

        warn!(instance = %instance_id, "Session logged out by the server, discarding stored credentials");

        if let Some(previous) = previous {
            self.teardown(slot, instance_id, previous, Duration::ZERO)
                .await;
        }

        let lock = self.storage_lock(instance_id);
        let _storage = lock.lock().await;
        if let Err(e) = self.inner.persistence.delete_session(instance_id).await {
            error!(instance = %instance_id, error = %e, "Failed to delete stored session");
        }
    }

    fn claim_disconnect(&self, state: &InstanceConnectionState, generation: u64) -> bool {
        if !state.is_current(generation) || !state.status().is_live() {
            return false;
        }
        if state.cleanup_in_progress() {
            debug!(instance = %state.instance_id, "Cleanup in progress, ignoring close");
            return false;
        }
        true
    }

    fn record_failure(
        &self,
        state: &mut InstanceConnectionState,
        reason: &DisconnectReason,
        now: Instant,
    ) {
        self.metrics()
            .disconnects_total
            .with_label_values(&[reason.label()])
            .inc();
        if state.breaker.record_failure(now) {
            self.metrics().breaker_trips_total.inc();
            warn!(
                instance = %state.instance_id,
                "Circuit breaker tripped, connects refused until the cooldown passes"
            );
        }
    }

    /// Arm the instance's retry timer, unless `generation` is no longer current
    pub(super) fn schedule_retry(
        &self,
        slot: &InstanceSlot,
        instance_id: &InstanceId,
        generation: u64,
        delay: Duration,
        reason: &str,
        is_network_timeout: bool,
    ) {
        let supervisor = self.clone();
        let target = instance_id.clone();

        let mut state = slot.lock();
        if !state.is_current(generation) {
            debug!(instance = %instance_id, "Not scheduling retry for a superseded attempt");
            return;
        }

        let outcome = self.inner.scheduler.schedule(
            &mut state.retry,
            instance_id,
            delay,
            reason,
            is_network_timeout,
            move |token| async move {
                supervisor.run_scheduled_retry(&target, token).await;
            },
        );

        match outcome {
            ScheduleOutcome::Scheduled { .. } => self.metrics().retries_scheduled_total.inc(),
            ScheduleOutcome::Stopped { .. } => self.metrics().network_timeout_stops_total.inc(),
        }
    }

    async fn run_scheduled_retry(&self, instance_id: &InstanceId, token: u64) {
        let Some(slot) = self.existing_slot(instance_id) else {
            return;
        };

        {
            let mut state = slot.lock();
            if !state.retry.take_if_current(token) {
                debug!(instance = %instance_id, token, "Retry timer superseded");
                return;
            }
            if state.status().is_live() || state.connection.is_some() {
                info!(instance = %instance_id, "Skipping retry, session already exists");
                return;
            }
        }

        match self.connect(instance_id).await {
            ConnectOutcome::Started(handle) => {
                info!(instance = %instance_id, generation = handle.generation, "Retry connection started")
            }
            ConnectOutcome::AlreadyInProgress(_) => {
                debug!(instance = %instance_id, "Retry found a connection in progress")
            }
            ConnectOutcome::Unavailable(
                UnavailableReason::CircuitOpen { remaining }
                | UnavailableReason::ConflictCooldown { remaining },
            ) => {
                // Come back once the cooldown is over
                let generation = slot.lock().generation;
                self.schedule_retry(&slot, instance_id, generation, remaining, "cooldown", false);
            }
            ConnectOutcome::Unavailable(reason) => {
                debug!(instance = %instance_id, %reason, "Scheduled retry did not connect")
            }
        }
    }
}
