//! Fan-out delivery of one event to many relays
//!
//! Every destination is attempted concurrently and settles on its own. The
//! delivery counts as a success when at least one relay accepted the event.

use crate::event::Event;
use crate::upstream::{ClientMessage, ConnectError, RelayConnector, RelayMessage};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How long a relay has to answer `OK` for a published event
pub const ACK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Error, PartialEq)]
pub enum PublishError {
    #[error("Connection failed: {0}")]
    Connect(#[from] ConnectError),
    #[error("Rejected: {0}")]
    Rejected(String),
    #[error("No acknowledgement within {0:?}")]
    Timeout(Duration),
    #[error("Connection closed before acknowledgement")]
    ConnectionClosed,
}

/// Publishes one event to one relay and waits for its verdict
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, relay: &str, event: &Event) -> Result<(), PublishError>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum ForwardStatus {
    Fulfilled,
    Rejected { reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ForwardResult {
    pub destination: String,
    pub status: ForwardStatus,
}

impl ForwardResult {
    pub fn is_fulfilled(&self) -> bool {
        self.status == ForwardStatus::Fulfilled
    }
}

/// Outcome of a delivery where at least one relay accepted
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryReport {
    pub results: Vec<ForwardResult>,
}

impl DeliveryReport {
    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|r| r.is_fulfilled()).count()
    }

    pub fn total(&self) -> usize {
        self.results.len()
    }

    pub fn summary(&self) -> String {
        format!(
            "Forwarded message to {}/{} relays",
            self.succeeded(),
            self.total()
        )
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
#[error("Delivery failed on all {} relays", .results.len())]
pub struct DeliveryFailedError {
    pub results: Vec<ForwardResult>,
}

impl DeliveryFailedError {
    /// `(destination, reason)` for every failed attempt
    pub fn reasons(&self) -> Vec<(String, String)> {
        self.results
            .iter()
            .filter_map(|r| match &r.status {
                ForwardStatus::Rejected { reason } => {
                    Some((r.destination.clone(), reason.clone()))
                }
                ForwardStatus::Fulfilled => None,
            })
            .collect()
    }
}

pub struct FanoutForwarder {
    publisher: Arc<dyn Publisher>,
}

impl FanoutForwarder {
    pub fn new(publisher: Arc<dyn Publisher>) -> Self {
        Self { publisher }
    }

    /// Deliver `event` to every destination, settling each independently
    pub async fn forward(
        &self,
        event: &Event,
        destinations: &[String],
    ) -> Result<DeliveryReport, DeliveryFailedError> {
        let mut seen = HashSet::new();
        let unique: Vec<&String> = destinations
            .iter()
            .filter(|d| seen.insert(d.as_str()))
            .collect();

        let attempts = unique.iter().map(|destination| async move {
            let status = match self.publisher.publish(destination, event).await {
                Ok(()) => ForwardStatus::Fulfilled,
                Err(e) => {
                    debug!(relay = %destination, event_id = %event.id, "Forward failed: {}", e);
                    ForwardStatus::Rejected {
                        reason: e.to_string(),
                    }
                }
            };
            ForwardResult {
                destination: destination.to_string(),
                status,
            }
        });
        let results = futures::future::join_all(attempts).await;

        if results.iter().any(ForwardResult::is_fulfilled) {
            let report = DeliveryReport { results };
            info!(event_id = %event.id, "{}", report.summary());
            Ok(report)
        } else {
            warn!(event_id = %event.id, relays = results.len(), "Delivery failed everywhere");
            Err(DeliveryFailedError { results })
        }
    }
}

// ============================================================================
// RELAY POOL
// ============================================================================

type Verdict = oneshot::Sender<Result<(), PublishError>>;

/// Waiters per event id; the same event may be in flight more than once
type PendingVerdicts = Arc<Mutex<HashMap<String, Vec<Verdict>>>>;

struct PooledRelay {
    outbound: mpsc::UnboundedSender<ClientMessage>,
    pending: PendingVerdicts,
    alive: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

impl PooledRelay {
    /// Drop waiters whose publisher gave up on `event_id`
    fn forget_abandoned(&self, event_id: &str) {
        let mut pending = self.pending.lock();
        if let Some(waiters) = pending.get_mut(event_id) {
            waiters.retain(|verdict| !verdict.is_closed());
            if waiters.is_empty() {
                pending.remove(event_id);
            }
        }
    }
}

impl Drop for PooledRelay {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// [`Publisher`] that keeps one connection per relay URL
pub struct RelayPool {
    connector: Arc<dyn RelayConnector>,
    relays: Mutex<HashMap<String, Arc<PooledRelay>>>,
    /// One dial in flight per URL
    dialing: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    ack_timeout: Duration,
}

impl RelayPool {
    pub fn new(connector: Arc<dyn RelayConnector>) -> Self {
        Self::with_ack_timeout(connector, ACK_TIMEOUT)
    }

    pub fn with_ack_timeout(connector: Arc<dyn RelayConnector>, ack_timeout: Duration) -> Self {
        Self {
            connector,
            relays: Mutex::new(HashMap::new()),
            dialing: Mutex::new(HashMap::new()),
            ack_timeout,
        }
    }

    pub fn connected_relays(&self) -> Vec<String> {
        let mut urls: Vec<String> = self
            .relays
            .lock()
            .iter()
            .filter(|(_, r)| r.alive.load(Ordering::SeqCst))
            .map(|(url, _)| url.clone())
            .collect();
        urls.sort();
        urls
    }

    /// Drop every pooled connection
    pub fn close(&self) {
        self.relays.lock().clear();
    }

    fn live(&self, url: &str) -> Option<Arc<PooledRelay>> {
        self.relays
            .lock()
            .get(url)
            .filter(|relay| relay.alive.load(Ordering::SeqCst))
            .cloned()
    }

    async fn relay(&self, url: &str) -> Result<Arc<PooledRelay>, PublishError> {
        if let Some(relay) = self.live(url) {
            return Ok(relay);
        }

        let dial_lock = Arc::clone(self.dialing.lock().entry(url.to_string()).or_default());
        let _dialing = dial_lock.lock().await;
        if let Some(relay) = self.live(url) {
            return Ok(relay);
        }

        debug!(relay = %url, "Opening pooled connection");
        let connection = self.connector.connect(url).await?;
        let mut inbound = connection.inbound;
        let pending: PendingVerdicts = Arc::new(Mutex::new(HashMap::new()));
        let alive = Arc::new(AtomicBool::new(true));

        let reader = tokio::spawn({
            let pending = Arc::clone(&pending);
            let alive = Arc::clone(&alive);
            let url = url.to_string();
            async move {
                while let Some(message) = inbound.recv().await {
                    if let RelayMessage::Ok {
                        event_id,
                        accepted,
                        message,
                    } = message
                    {
                        let waiters = pending.lock().remove(&event_id).unwrap_or_default();
                        for verdict in waiters {
                            let result = if accepted {
                                Ok(())
                            } else {
                                Err(PublishError::Rejected(message.clone()))
                            };
                            let _ = verdict.send(result);
                        }
                    }
                }
                alive.store(false, Ordering::SeqCst);
                for (_, waiters) in pending.lock().drain() {
                    for verdict in waiters {
                        let _ = verdict.send(Err(PublishError::ConnectionClosed));
                    }
                }
                debug!(relay = %url, "Pooled connection closed");
            }
        });

        let relay = Arc::new(PooledRelay {
            outbound: connection.outbound,
            pending,
            alive,
            reader,
        });
        self.relays.lock().insert(url.to_string(), Arc::clone(&relay));
        Ok(relay)
    }
}

#[async_trait]
impl Publisher for RelayPool {
    async fn publish(&self, relay_url: &str, event: &Event) -> Result<(), PublishError> {
        let relay = self.relay(relay_url).await?;

        let (tx, rx) = oneshot::channel();
        relay
            .pending
            .lock()
            .entry(event.id.clone())
            .or_default()
            .push(tx);
        if relay
            .outbound
            .send(ClientMessage::Event(event.clone()))
            .is_err()
        {
            relay.pending.lock().remove(&event.id);
            return Err(PublishError::ConnectionClosed);
        }

        let verdict = tokio::time::timeout(self.ack_timeout, rx).await;
        match verdict {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(PublishError::ConnectionClosed),
            Err(_) => {
                relay.forget_abandoned(&event.id);
                Err(PublishError::Timeout(self.ack_timeout))
            }
        }
    }
}
