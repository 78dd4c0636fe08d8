//! In-memory collaborators: a session store and a recording delivery target

use crate::core::errors::{PersistenceError, SendError};
use crate::core::types::{InstanceId, MessagePayload};
use crate::persistence::PersistenceSink;
use crate::queue::DeliveryTarget;
use crate::transport::{Credentials, UserInfo};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Session store that keeps everything in memory and counts calls
#[derive(Default)]
pub struct MemorySessionStore {
    credentials: Mutex<HashMap<InstanceId, Credentials>>,
    accounts: Mutex<HashMap<InstanceId, UserInfo>>,
    save_delay: Mutex<Option<Duration>>,
    saves: AtomicUsize,
    deletes: AtomicUsize,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-seed credentials as if the instance had paired before
    pub fn with_credentials(self, instance_id: &InstanceId, credentials: Credentials) -> Self {
        self.credentials
            .lock()
            .insert(instance_id.clone(), credentials);
        self
    }

    pub fn credentials(&self, instance_id: &InstanceId) -> Option<Credentials> {
        self.credentials.lock().get(instance_id).cloned()
    }

    pub fn account(&self, instance_id: &InstanceId) -> Option<UserInfo> {
        self.accounts.lock().get(instance_id).cloned()
    }

    /// Make every later credentials save take this long
    pub fn set_save_delay(&self, delay: Duration) {
        *self.save_delay.lock() = Some(delay);
    }

    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::Relaxed)
    }

    pub fn delete_count(&self) -> usize {
        self.deletes.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl PersistenceSink for MemorySessionStore {
    async fn load_credentials(
        &self,
        instance_id: &InstanceId,
    ) -> Result<Option<Credentials>, PersistenceError> {
        Ok(self.credentials(instance_id))
    }

    async fn save_credentials(
        &self,
        instance_id: &InstanceId,
        credentials: &Credentials,
    ) -> Result<(), PersistenceError> {
        let delay = *self.save_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.saves.fetch_add(1, Ordering::Relaxed);
        self.credentials
            .lock()
            .insert(instance_id.clone(), credentials.clone());
        Ok(())
    }

    async fn save_account(
        &self,
        instance_id: &InstanceId,
        user: &UserInfo,
    ) -> Result<(), PersistenceError> {
        self.accounts.lock().insert(instance_id.clone(), user.clone());
        Ok(())
    }

    async fn delete_session(&self, instance_id: &InstanceId) -> Result<(), PersistenceError> {
        self.deletes.fetch_add(1, Ordering::Relaxed);
        self.credentials.lock().remove(instance_id);
        self.accounts.lock().remove(instance_id);
        Ok(())
    }
}

/// Delivery target with per-instance readiness and scripted send results
#[derive(Default)]
pub struct RecordingTarget {
    ready: Mutex<HashSet<InstanceId>>,
    outcomes: Mutex<VecDeque<Result<(), SendError>>>,
    send_delay: Mutex<Option<Duration>>,
    sent: Mutex<Vec<(InstanceId, MessagePayload)>>,
    attempts: AtomicUsize,
}

impl RecordingTarget {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_ready(&self, instance_id: &InstanceId, ready: bool) {
        let mut set = self.ready.lock();
        if ready {
            set.insert(instance_id.clone());
        } else {
            set.remove(instance_id);
        }
    }

    /// Result for the next send; sends succeed once the script runs out
    pub fn push_outcome(&self, outcome: Result<(), SendError>) {
        self.outcomes.lock().push_back(outcome);
    }

    pub fn set_send_delay(&self, delay: Duration) {
        *self.send_delay.lock() = Some(delay);
    }

    /// Successful sends, in order
    pub fn sent(&self) -> Vec<(InstanceId, MessagePayload)> {
        self.sent.lock().clone()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl DeliveryTarget for RecordingTarget {
    fn is_ready(&self, instance_id: &InstanceId) -> bool {
        self.ready.lock().contains(instance_id)
    }

    async fn send(
        &self,
        instance_id: &InstanceId,
        payload: &MessagePayload,
    ) -> Result<(), SendError> {
        self.attempts.fetch_add(1, Ordering::Relaxed);

        let delay = *self.send_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let outcome = self.outcomes.lock().pop_front().unwrap_or(Ok(()));
        if outcome.is_ok() {
            self.sent
                .lock()
                .push((instance_id.clone(), payload.clone()));
        }
        outcome
    }
}
