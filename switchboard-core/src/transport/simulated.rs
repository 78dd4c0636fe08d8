//! In-process transport for running the gateway without a real network
//!
//! Unpaired instances receive a pairing code, then "pair" after a delay and
//! open. Paired instances open after a short latency. Sends can be made to
//! fail at random to exercise the retry path.

use super::{Credentials, Transport, TransportConnection, TransportEvent, TransportSession, UserInfo};
use crate::core::errors::TransportError;
use crate::core::types::{InstanceId, MessagePayload};
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

const EVENT_BUFFER: usize = 16;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    #[serde(default = "default_open_latency_ms")]
    pub open_latency_ms: u64,
    /// Time between issuing a pairing code and the simulated scan
    #[serde(default = "default_pairing_delay_ms")]
    pub pairing_delay_ms: u64,
    #[serde(default = "default_send_latency_ms")]
    pub send_latency_ms: u64,
    /// Probability (0.0 to 1.0) that a send fails
    #[serde(default)]
    pub send_failure_rate: f64,
    /// Issue a pairing code when no credentials are stored
    #[serde(default = "default_require_pairing")]
    pub require_pairing: bool,
}

fn default_open_latency_ms() -> u64 {
    200
}

fn default_pairing_delay_ms() -> u64 {
    5_000
}

fn default_send_latency_ms() -> u64 {
    50
}

fn default_require_pairing() -> bool {
    true
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            open_latency_ms: default_open_latency_ms(),
            pairing_delay_ms: default_pairing_delay_ms(),
            send_latency_ms: default_send_latency_ms(),
            send_failure_rate: 0.0,
            require_pairing: default_require_pairing(),
        }
    }
}

impl SimulationConfig {
    /// No latency, no pairing, no failures
    pub fn instant() -> Self {
        Self {
            open_latency_ms: 0,
            pairing_delay_ms: 0,
            send_latency_ms: 0,
            send_failure_rate: 0.0,
            require_pairing: false,
        }
    }
}

pub struct SimulatedTransport {
    config: SimulationConfig,
}

impl SimulatedTransport {
    pub fn new(config: SimulationConfig) -> Self {
        info!(?config, "Creating simulated transport");
        Self { config }
    }
}

#[async_trait]
impl Transport for SimulatedTransport {
    async fn open(
        &self,
        instance_id: &InstanceId,
        credentials: Option<Credentials>,
    ) -> Result<TransportConnection, TransportError> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let session = Arc::new(SimulatedSession {
            instance_id: instance_id.clone(),
            closed: AtomicBool::new(false),
            events: Mutex::new(Some(tx.clone())),
            send_latency: Duration::from_millis(self.config.send_latency_ms),
            send_failure_rate: self.config.send_failure_rate,
        });

        let needs_pairing = credentials.is_none() && self.config.require_pairing;
        let open_latency = Duration::from_millis(self.config.open_latency_ms);
        let pairing_delay = Duration::from_millis(self.config.pairing_delay_ms);
        let user = UserInfo {
            id: format!("{}@simulated", instance_id),
            name: Some(instance_id.to_string()),
        };
        let instance = instance_id.clone();

        // The handshake task only holds a weak sender so closing the
        // session ends the event stream.
        let events = tx.downgrade();
        drop(tx);

        tokio::spawn(async move {
            tokio::time::sleep(open_latency).await;

            if needs_pairing {
                let code = {
                    let mut rng = rand::thread_rng();
                    format!("SIM-{:016x}", rng.gen::<u64>())
                };
                debug!(instance = %instance, "Issuing simulated pairing code");
                if !emit(&events, TransportEvent::QrCodeIssued(code)).await {
                    return;
                }

                tokio::time::sleep(pairing_delay).await;
                let creds = Credentials(serde_json::json!({
                    "instance": instance.as_str(),
                    "device": "simulated",
                }));
                if !emit(&events, TransportEvent::CredentialsUpdated(creds)).await {
                    return;
                }
            }

            emit(&events, TransportEvent::Opened(user)).await;
        });

        Ok(TransportConnection {
            session,
            events: rx,
        })
    }
}

async fn emit(events: &mpsc::WeakSender<TransportEvent>, event: TransportEvent) -> bool {
    match events.upgrade() {
        Some(tx) => tx.send(event).await.is_ok(),
        None => false,
    }
}

struct SimulatedSession {
    instance_id: InstanceId,
    closed: AtomicBool,
    events: Mutex<Option<mpsc::Sender<TransportEvent>>>,
    send_latency: Duration,
    send_failure_rate: f64,
}

#[async_trait]
impl TransportSession for SimulatedSession {
    async fn send(&self, payload: &MessagePayload) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::NotConnected);
        }

        tokio::time::sleep(self.send_latency).await;

        let failed = self.send_failure_rate > 0.0
            && rand::thread_rng().gen_bool(self.send_failure_rate.clamp(0.0, 1.0));
        if failed {
            return Err(TransportError::Send(format!(
                "simulated failure sending to {}",
                payload.recipient
            )));
        }

        debug!(instance = %self.instance_id, recipient = %payload.recipient, "Simulated send");
        Ok(())
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!(instance = %self.instance_id, "Closing simulated session");
        }
        self.events.lock().take();
    }
}
