//! Scriptable transport for integration testing
//!
//! Every `open` creates a [`MockSession`] whose event stream the test drives
//! through [`MockTransport::emit`]. Open failures, open latency and send
//! results can be scripted per test.

use crate::core::errors::TransportError;
use crate::core::types::{InstanceId, MessagePayload};
use crate::transport::{
    Credentials, Transport, TransportConnection, TransportEvent, TransportSession, UserInfo,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const EVENT_BUFFER: usize = 32;

/// What a successful `open` emits on its own
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OpenBehavior {
    /// Nothing; the test emits every event
    #[default]
    Manual,
    /// Emit `Opened` right away
    AutoOpen,
    /// Emit a pairing code right away
    IssueQr,
}

#[derive(Default)]
struct Shared {
    behavior: OpenBehavior,
    open_delay: Option<Duration>,
    send_delay: Option<Duration>,
    open_failures: HashMap<InstanceId, VecDeque<TransportError>>,
    open_counts: HashMap<InstanceId, usize>,
    last_credentials: HashMap<InstanceId, Option<Credentials>>,
    sessions: HashMap<InstanceId, Vec<Arc<MockSession>>>,
    send_results: VecDeque<Result<(), TransportError>>,
    sent: Vec<(InstanceId, MessagePayload)>,
}

pub struct MockSession {
    instance_id: InstanceId,
    events: Mutex<Option<mpsc::Sender<TransportEvent>>>,
    closed: AtomicBool,
    shared: Arc<Mutex<Shared>>,
    closes: Arc<AtomicUsize>,
}

impl MockSession {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[async_trait]
impl TransportSession for MockSession {
    async fn send(&self, payload: &MessagePayload) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::NotConnected);
        }
        let delay = self.shared.lock().send_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
            // Closed mid-send
            if self.is_closed() {
                return Err(TransportError::NotConnected);
            }
        }
        let mut shared = self.shared.lock();
        let result = shared.send_results.pop_front().unwrap_or(Ok(()));
        if result.is_ok() {
            shared.sent.push((self.instance_id.clone(), payload.clone()));
        }
        result
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.closes.fetch_add(1, Ordering::Relaxed);
        }
        self.events.lock().take();
    }
}

#[derive(Clone, Default)]
pub struct MockTransport {
    shared: Arc<Mutex<Shared>>,
    closes: Arc<AtomicUsize>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_behavior(behavior: OpenBehavior) -> Self {
        let transport = Self::new();
        transport.set_open_behavior(behavior);
        transport
    }

    pub fn set_open_behavior(&self, behavior: OpenBehavior) {
        self.shared.lock().behavior = behavior;
    }

    pub fn set_open_delay(&self, delay: Duration) {
        self.shared.lock().open_delay = Some(delay);
    }

    pub fn set_send_delay(&self, delay: Duration) {
        self.shared.lock().send_delay = Some(delay);
    }

    /// Make the next `open` for `instance_id` fail with `error`
    pub fn fail_next_open(&self, instance_id: &InstanceId, error: TransportError) {
        self.shared
            .lock()
            .open_failures
            .entry(instance_id.clone())
            .or_default()
            .push_back(error);
    }

    /// Result for the next send on any session
    pub fn push_send_result(&self, result: Result<(), TransportError>) {
        self.shared.lock().send_results.push_back(result);
    }

    /// Deliver an event on the instance's newest open session.
    ///
    /// Returns false when there is no open session to deliver to.
    pub async fn emit(&self, instance_id: &InstanceId, event: TransportEvent) -> bool {
        let sender = {
            let shared = self.shared.lock();
            shared
                .sessions
                .get(instance_id)
                .and_then(|sessions| sessions.last())
                .filter(|session| !session.is_closed())
                .and_then(|session| session.events.lock().clone())
        };

        match sender {
            Some(sender) => sender.send(event).await.is_ok(),
            None => false,
        }
    }

    pub async fn emit_opened(&self, instance_id: &InstanceId) -> bool {
        self.emit(instance_id, TransportEvent::Opened(user_for(instance_id)))
            .await
    }

    pub fn open_count(&self, instance_id: &InstanceId) -> usize {
        self.shared
            .lock()
            .open_counts
            .get(instance_id)
            .copied()
            .unwrap_or(0)
    }

    /// Credentials passed to the latest `open` for the instance
    pub fn last_credentials(&self, instance_id: &InstanceId) -> Option<Credentials> {
        self.shared
            .lock()
            .last_credentials
            .get(instance_id)
            .cloned()
            .flatten()
    }

    /// Sessions for the instance that have not been closed
    pub fn live_sessions(&self, instance_id: &InstanceId) -> usize {
        self.shared
            .lock()
            .sessions
            .get(instance_id)
            .map_or(0, |sessions| sessions.iter().filter(|s| !s.is_closed()).count())
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::Relaxed)
    }

    pub fn sent(&self) -> Vec<(InstanceId, MessagePayload)> {
        self.shared.lock().sent.clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(
        &self,
        instance_id: &InstanceId,
        credentials: Option<Credentials>,
    ) -> Result<TransportConnection, TransportError> {
        let delay = {
            let mut shared = self.shared.lock();
            *shared.open_counts.entry(instance_id.clone()).or_default() += 1;
            shared
                .last_credentials
                .insert(instance_id.clone(), credentials);
            shared.open_delay
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut shared = self.shared.lock();
        if let Some(error) = shared
            .open_failures
            .get_mut(instance_id)
            .and_then(VecDeque::pop_front)
        {
            return Err(error);
        }

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        match shared.behavior {
            OpenBehavior::Manual => {}
            OpenBehavior::AutoOpen => {
                let _ = tx.try_send(TransportEvent::Opened(user_for(instance_id)));
            }
            OpenBehavior::IssueQr => {
                let _ = tx.try_send(TransportEvent::QrCodeIssued(format!("qr-{}", instance_id)));
            }
        }

        let session = Arc::new(MockSession {
            instance_id: instance_id.clone(),
            events: Mutex::new(Some(tx)),
            closed: AtomicBool::new(false),
            shared: Arc::clone(&self.shared),
            closes: Arc::clone(&self.closes),
        });
        shared
            .sessions
            .entry(instance_id.clone())
            .or_default()
            .push(Arc::clone(&session));

        Ok(TransportConnection {
            session,
            events: rx,
        })
    }
}

pub fn user_for(instance_id: &InstanceId) -> UserInfo {
    UserInfo {
        id: format!("{}@mock", instance_id),
        name: Some(format!("Mock {}", instance_id)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::errors::DisconnectReason;

    #[tokio::test]
    async fn test_scripted_open_failure() {
        let transport = MockTransport::new();
        let id = InstanceId::from("a");
        transport.fail_next_open(&id, TransportError::Closed(DisconnectReason::NetworkTimeout));

        assert!(transport.open(&id, None).await.is_err());
        assert!(transport.open(&id, None).await.is_ok());
        assert_eq!(transport.open_count(&id), 2);
        assert_eq!(transport.live_sessions(&id), 1);
    }

    #[tokio::test]
    async fn test_close_ends_event_stream() {
        let transport = MockTransport::with_behavior(OpenBehavior::AutoOpen);
        let id = InstanceId::from("a");

        let mut conn = transport.open(&id, None).await.unwrap();
        assert!(matches!(conn.events.recv().await, Some(TransportEvent::Opened(_))));

        conn.session.close().await;
        conn.session.close().await;
        assert!(conn.events.recv().await.is_none());
        assert_eq!(transport.close_count(), 1);
        assert!(!transport.emit_opened(&id).await);
    }

    #[tokio::test]
    async fn test_send_results_are_scripted() {
        let transport = MockTransport::new();
        let id = InstanceId::from("a");
        let conn = transport.open(&id, None).await.unwrap();
        transport.push_send_result(Err(TransportError::Send("boom".to_string())));

        let payload = MessagePayload::text("+1", "hi");
        assert!(conn.session.send(&payload).await.is_err());
        assert!(conn.session.send(&payload).await.is_ok());
        assert_eq!(transport.sent(), vec![(id, payload)]);
    }
}
