//! Relay Bridge: ties a community's local relay to its upstream relay
//!
//! Local events go up through the [`UpstreamLink`]; upstream events land in
//! the local [`EventStore`]. Channel subscriptions follow local demand via
//! the [`ChannelSyncEngine`].

use crate::community::CommunityDefinition;
use crate::event::{Event, Filter};
use crate::store::EventStore;
use crate::sync::ChannelSyncEngine;
use crate::upstream::{AddressResolver, LinkError, RelayConnector, UpstreamEvent, UpstreamLink};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const METADATA_SUBSCRIPTION_ID: &str = "metadata-sync";

/// Profile, relay list, community definition and group metadata kinds
pub const METADATA_KINDS: [u32; 6] = [0, 10002, 12012, 39000, 39001, 39002];

/// A local client's live filter set, owned by the local relay
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveSubscription {
    pub id: String,
    pub filters: Vec<Filter>,
}

/// Receives upstream connection state changes
pub trait UpstreamStatusSink: Send + Sync {
    fn relay_status(&self, url: &str, connected: bool);
}

struct BridgeCore {
    link: UpstreamLink,
    engine: Mutex<ChannelSyncEngine>,
    store: Arc<dyn EventStore>,
    status: Mutex<Option<Arc<dyn UpstreamStatusSink>>>,
}

impl BridgeCore {
    fn ingest(&self, event: &Event) {
        match self.store.add_event(event) {
            Ok(true) => debug!(event_id = %event.id, "Stored upstream event"),
            Ok(false) => debug!(event_id = %event.id, "Upstream event already stored"),
            Err(e) => warn!(event_id = %event.id, "Failed to store upstream event: {}", e),
        }
    }

    fn report(&self, url: &str, connected: bool) {
        let sink = self.status.lock().clone();
        if let Some(sink) = sink {
            sink.relay_status(url, connected);
        }
    }

    fn sync_metadata(&self) {
        match self.link.subscribe(
            METADATA_SUBSCRIPTION_ID,
            vec![Filter::new().kinds(METADATA_KINDS)],
        ) {
            Ok(()) => info!(owner = %self.link.definition().owner, "Opening subscription to sync metadata"),
            Err(e) => debug!("Skipping metadata sync: {}", e),
        }
    }

    /// Notifications from a session older than the live one
    fn is_stale(&self, generation: u64) -> bool {
        matches!(self.link.session_generation(), Some(current) if current != generation)
    }

    fn handle_upstream(&self, event: UpstreamEvent) {
        match event {
            UpstreamEvent::Event {
                subscription,
                event,
            } => {
                debug!(subscription = %subscription, event_id = %event.id, "Upstream event");
                self.ingest(&event);
            }
            UpstreamEvent::SubscriptionClosed {
                subscription,
                reason,
                generation,
            } => {
                if self.is_stale(generation) {
                    debug!(subscription = %subscription, generation, "Ignoring close from old session");
                } else if subscription == METADATA_SUBSCRIPTION_ID {
                    info!("Closed metadata sync: {}", reason);
                } else if let Some(channel) = self.engine.lock().on_upstream_closed(&subscription) {
                    debug!(channel = %channel, "Channel sync closed: {}", reason);
                }
            }
            UpstreamEvent::Settled { .. } => {
                self.sync_metadata();
                self.engine.lock().reconcile();
            }
            UpstreamEvent::Disconnected { url, generation } => {
                if self.is_stale(generation) {
                    debug!(relay = %url, generation, "Ignoring disconnect from old session");
                    return;
                }
                self.engine.lock().reset();
                self.report(&url, false);
            }
        }
    }
}

/// Bridge for one hosted community
pub struct RelayBridge {
    core: Arc<BridgeCore>,
    events: Mutex<Option<mpsc::UnboundedReceiver<UpstreamEvent>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl RelayBridge {
    pub fn new(
        definition: CommunityDefinition,
        resolver: Arc<dyn AddressResolver>,
        connector: Arc<dyn RelayConnector>,
        store: Arc<dyn EventStore>,
    ) -> Self {
        let (observer, events) = mpsc::unbounded_channel();
        let link = UpstreamLink::new(definition, resolver, connector, observer);
        let engine = ChannelSyncEngine::new(Arc::new(link.clone()));
        Self {
            core: Arc::new(BridgeCore {
                link,
                engine: Mutex::new(engine),
                store,
                status: Mutex::new(None),
            }),
            events: Mutex::new(Some(events)),
            pump: Mutex::new(None),
            stopped: AtomicBool::new(false),
        }
    }

    /// Report upstream connect/disconnect to `sink`
    pub fn set_status_sink(&self, sink: Arc<dyn UpstreamStatusSink>) {
        *self.core.status.lock() = Some(sink);
    }

    pub fn definition(&self) -> &CommunityDefinition {
        self.core.link.definition()
    }

    pub fn link(&self) -> &UpstreamLink {
        &self.core.link
    }

    /// Channels with an open upstream subscription
    pub fn synced_channels(&self) -> Vec<String> {
        self.core.engine.lock().open_channels()
    }

    /// Start pumping upstream events and connect
    pub async fn start(&self) -> Result<(), LinkError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(LinkError::Closed);
        }
        self.ensure_connected().await
    }

    fn spawn_pump(&self) {
        let Some(mut events) = self.events.lock().take() else {
            return;
        };
        let core = Arc::clone(&self.core);
        let handle = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                core.handle_upstream(event);
            }
        });
        *self.pump.lock() = Some(handle);
    }

    /// Starts the pump before connecting, on every connect path
    async fn ensure_connected(&self) -> Result<(), LinkError> {
        self.spawn_pump();
        if self.core.link.is_connected() {
            return Ok(());
        }
        self.core.link.connect().await?;
        if let Some(url) = self.core.link.address() {
            self.core.report(&url, true);
        }
        Ok(())
    }

    /// A local client published `event`; forward it upstream, best-effort
    pub fn on_local_event_received(&self, event: &Event) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        debug!(event_id = %event.id, "Sending event to upstream");
        self.core.link.publish(event);
    }

    /// An event arrived from upstream
    pub fn on_upstream_event(&self, event: &Event) {
        self.core.ingest(event);
    }

    pub async fn on_local_subscription_created(&self, subscription: &ActiveSubscription) {
        self.on_local_subscription_changed(subscription).await;
    }

    pub async fn on_local_subscription_updated(&self, subscription: &ActiveSubscription) {
        self.on_local_subscription_changed(subscription).await;
    }

    async fn on_local_subscription_changed(&self, subscription: &ActiveSubscription) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.ensure_connected().await {
            warn!(owner = %self.definition().owner, "Upstream unavailable for channel sync: {}", e);
        }
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        self.core
            .engine
            .lock()
            .on_subscription_changed(&subscription.id, &subscription.filters);
    }

    pub fn on_local_subscription_closed(&self, subscription_id: &str) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        self.core.engine.lock().on_subscription_removed(subscription_id);
    }

    /// Close channel subscriptions and the link. Idempotent.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.core.engine.lock().close_all();
        self.core.link.close();
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
        info!(owner = %self.definition().owner, "Bridge stopped");
    }
}

impl Drop for RelayBridge {
    fn drop(&mut self) {
        self.stop();
    }
}
