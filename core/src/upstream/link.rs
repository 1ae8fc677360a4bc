//! One outbound connection to a community's remote relay

use super::connection::{ConnectError, Connection, RelayConnector};
use super::protocol::{ClientMessage, RelayMessage};
use super::resolver::{AddressResolver, ResolutionError};
use crate::community::CommunityDefinition;
use crate::event::{Event, Filter};
use crate::sync::UpstreamSubscriber;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Delay between a successful connect and the `Settled` notification
pub const METADATA_SETTLE_DELAY: Duration = Duration::from_millis(100);

/// Notifications a link delivers to its owner
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamEvent {
    /// An event arrived on one of our subscriptions
    Event { subscription: String, event: Event },
    /// The relay (or the connection going away) ended a subscription
    SubscriptionClosed {
        subscription: String,
        reason: String,
        generation: u64,
    },
    /// The connection has been up for [`METADATA_SETTLE_DELAY`]
    Settled { url: String },
    /// The remote side closed session `generation`
    Disconnected { url: String, generation: u64 },
}

#[derive(Debug, Error)]
pub enum AddressResolutionError {
    #[error("No usable relay address for community {owner}")]
    NoAddress { owner: String },
    #[error("Failed to resolve tunnel address {address}: {source}")]
    Tunnel {
        address: String,
        #[source]
        source: ResolutionError,
    },
    #[error("Invalid relay URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
}

#[derive(Debug, Error)]
pub enum LinkError {
    #[error(transparent)]
    AddressResolution(#[from] AddressResolutionError),
    #[error("Connection failed: {0}")]
    ConnectionFailed(#[from] ConnectError),
    #[error("Not connected to upstream")]
    NotConnected,
    #[error("Link closed while connecting")]
    Closed,
}

struct Session {
    generation: u64,
    outbound: mpsc::UnboundedSender<ClientMessage>,
    subscriptions: HashSet<String>,
    dispatcher: JoinHandle<()>,
    settle: JoinHandle<()>,
}

#[derive(Default)]
struct LinkState {
    address: Option<String>,
    session: Option<Session>,
    next_generation: u64,
    /// Bumped by `close()` so in-flight connects are abandoned
    epoch: u64,
}

struct LinkInner {
    definition: CommunityDefinition,
    resolver: Arc<dyn AddressResolver>,
    connector: Arc<dyn RelayConnector>,
    observer: mpsc::UnboundedSender<UpstreamEvent>,
    state: Mutex<LinkState>,
    connecting: tokio::sync::Mutex<()>,
}

/// Outbound link to the relay named by a [`CommunityDefinition`]
///
/// Holds at most one live session. There is no automatic reconnect: after a
/// remote close the link stays down until the next [`UpstreamLink::connect`].
#[derive(Clone)]
pub struct UpstreamLink {
    inner: Arc<LinkInner>,
}

fn validate_url(url: &str) -> Result<String, AddressResolutionError> {
    let parsed = url::Url::parse(url).map_err(|e| AddressResolutionError::InvalidUrl {
        url: url.to_string(),
        reason: e.to_string(),
    })?;
    match parsed.scheme() {
        "ws" | "wss" => Ok(url.to_string()),
        scheme => Err(AddressResolutionError::InvalidUrl {
            url: url.to_string(),
            reason: format!("unsupported scheme {}", scheme),
        }),
    }
}

impl UpstreamLink {
    pub fn new(
        definition: CommunityDefinition,
        resolver: Arc<dyn AddressResolver>,
        connector: Arc<dyn RelayConnector>,
        observer: mpsc::UnboundedSender<UpstreamEvent>,
    ) -> Self {
        Self {
            inner: Arc::new(LinkInner {
                definition,
                resolver,
                connector,
                observer,
                state: Mutex::new(LinkState::default()),
                connecting: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn definition(&self) -> &CommunityDefinition {
        &self.inner.definition
    }

    /// Last resolved relay URL
    pub fn address(&self) -> Option<String> {
        self.inner.state.lock().address.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.state.lock().session.is_some()
    }

    /// Generation of the live session, if any
    pub fn session_generation(&self) -> Option<u64> {
        self.inner.state.lock().session.as_ref().map(|s| s.generation)
    }

    /// Work out which URL to dial
    ///
    /// A direct URL wins over tunnel addresses; a tunnel address goes through
    /// the resolver and becomes `ws://host:port/`.
    pub async fn resolve_address(&self) -> Result<String, AddressResolutionError> {
        let definition = &self.inner.definition;
        if let Some(url) = definition.direct_url() {
            return validate_url(url);
        }

        if let Some(tunnel) = definition.tunnel_address() {
            let resolved = self
                .inner
                .resolver
                .resolve(tunnel)
                .await
                .map_err(|source| AddressResolutionError::Tunnel {
                    address: tunnel.to_string(),
                    source,
                })?;
            let url = resolved
                .websocket_url()
                .map_err(|e| AddressResolutionError::InvalidUrl {
                    url: format!("{}:{}", resolved.address, resolved.port),
                    reason: e.to_string(),
                })?;
            info!(tunnel = %tunnel, relay = %url, "Bound tunnel address");
            return Ok(url);
        }

        Err(AddressResolutionError::NoAddress {
            owner: definition.owner.clone(),
        })
    }

    /// Connect if not already connected
    pub async fn connect(&self) -> Result<(), LinkError> {
        if self.is_connected() {
            return Ok(());
        }

        let _connecting = self.inner.connecting.lock().await;
        if self.is_connected() {
            return Ok(());
        }
        let epoch = self.inner.state.lock().epoch;

        let url = self.resolve_address().await?;
        self.inner.state.lock().address = Some(url.clone());

        info!(relay = %url, owner = %self.inner.definition.owner, "Connecting to upstream");
        let connection = self.inner.connector.connect(&url).await?;
        self.install(epoch, url, connection)
    }

    fn install(&self, epoch: u64, url: String, connection: Connection) -> Result<(), LinkError> {
        let Connection {
            outbound,
            mut inbound,
        } = connection;

        let mut state = self.inner.state.lock();
        if state.epoch != epoch {
            debug!(relay = %url, "Discarding connection opened across close()");
            return Err(LinkError::Closed);
        }

        state.next_generation += 1;
        let generation = state.next_generation;

        let weak: Weak<LinkInner> = Arc::downgrade(&self.inner);
        let dispatcher = tokio::spawn({
            let weak = weak.clone();
            async move {
                while let Some(message) = inbound.recv().await {
                    match weak.upgrade() {
                        Some(inner) => inner.handle_message(generation, message),
                        None => return,
                    }
                }
                if let Some(inner) = weak.upgrade() {
                    inner.handle_remote_close(generation);
                }
            }
        });
        let settle = tokio::spawn(async move {
            tokio::time::sleep(METADATA_SETTLE_DELAY).await;
            if let Some(inner) = weak.upgrade() {
                inner.handle_settled(generation);
            }
        });

        state.session = Some(Session {
            generation,
            outbound,
            subscriptions: HashSet::new(),
            dispatcher,
            settle,
        });
        Ok(())
    }

    /// Best-effort publish; dropped with a warning when not connected
    pub fn publish(&self, event: &Event) {
        let state = self.inner.state.lock();
        match &state.session {
            Some(session) => {
                if session
                    .outbound
                    .send(ClientMessage::Event(event.clone()))
                    .is_err()
                {
                    warn!(event_id = %event.id, "Upstream writer gone; event dropped");
                } else {
                    debug!(event_id = %event.id, "Sent event to upstream");
                }
            }
            None => {
                warn!(event_id = %event.id, "Upstream not connected; event dropped");
            }
        }
    }

    /// Open (or replace) subscription `id` on the current session
    pub fn subscribe(&self, id: &str, filters: Vec<Filter>) -> Result<(), LinkError> {
        let mut state = self.inner.state.lock();
        let session = state.session.as_mut().ok_or(LinkError::NotConnected)?;
        session
            .outbound
            .send(ClientMessage::Req {
                id: id.to_string(),
                filters,
            })
            .map_err(|_| LinkError::NotConnected)?;
        session.subscriptions.insert(id.to_string());
        Ok(())
    }

    /// Close subscription `id`; returns whether it was open
    pub fn unsubscribe(&self, id: &str) -> bool {
        let mut state = self.inner.state.lock();
        let Some(session) = state.session.as_mut() else {
            return false;
        };
        if !session.subscriptions.remove(id) {
            return false;
        }
        let _ = session.outbound.send(ClientMessage::Close(id.to_string()));
        true
    }

    /// Subscription ids open on the current session
    pub fn subscriptions(&self) -> Vec<String> {
        let state = self.inner.state.lock();
        let mut ids: Vec<String> = state
            .session
            .as_ref()
            .map(|s| s.subscriptions.iter().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    /// Tear down the connection, if any. Idempotent.
    pub fn close(&self) {
        let session = {
            let mut state = self.inner.state.lock();
            state.epoch += 1;
            state.session.take()
        };
        if let Some(session) = session {
            session.dispatcher.abort();
            session.settle.abort();
            info!(owner = %self.inner.definition.owner, "Closed upstream connection");
        }
    }
}

impl LinkInner {
    fn notify(&self, event: UpstreamEvent) {
        if self.observer.send(event).is_err() {
            debug!("Upstream observer gone");
        }
    }

    fn handle_message(&self, generation: u64, message: RelayMessage) {
        match message {
            RelayMessage::Event {
                subscription,
                event,
            } => {
                let known = {
                    let state = self.state.lock();
                    match &state.session {
                        Some(s) if s.generation == generation => {
                            s.subscriptions.contains(&subscription)
                        }
                        _ => return,
                    }
                };
                if known {
                    self.notify(UpstreamEvent::Event {
                        subscription,
                        event,
                    });
                } else {
                    debug!(subscription = %subscription, "Dropping event for unknown subscription");
                }
            }
            RelayMessage::Closed {
                subscription,
                message,
            } => {
                let removed = {
                    let mut state = self.state.lock();
                    match state.session.as_mut() {
                        Some(s) if s.generation == generation => {
                            s.subscriptions.remove(&subscription)
                        }
                        _ => false,
                    }
                };
                if removed {
                    debug!(subscription = %subscription, "Upstream closed subscription: {}", message);
                    self.notify(UpstreamEvent::SubscriptionClosed {
                        subscription,
                        reason: message,
                        generation,
                    });
                }
            }
            RelayMessage::Eose(subscription) => {
                debug!(subscription = %subscription, "End of stored events");
            }
            RelayMessage::Notice(notice) => {
                info!(owner = %self.definition.owner, "Upstream notice: {}", notice);
            }
            RelayMessage::Ok {
                event_id,
                accepted,
                message,
            } => {
                if accepted {
                    debug!(event_id = %event_id, "Upstream accepted event");
                } else {
                    warn!(event_id = %event_id, "Upstream rejected event: {}", message);
                }
            }
        }
    }

    fn handle_remote_close(&self, generation: u64) {
        let (session, url) = {
            let mut state = self.state.lock();
            match &state.session {
                Some(s) if s.generation == generation => {}
                _ => return,
            }
            (state.session.take(), state.address.clone().unwrap_or_default())
        };
        let Some(session) = session else {
            return;
        };
        session.settle.abort();
        info!(relay = %url, "Upstream connection closed");

        let mut subscriptions: Vec<String> = session.subscriptions.into_iter().collect();
        subscriptions.sort();
        for subscription in subscriptions {
            self.notify(UpstreamEvent::SubscriptionClosed {
                subscription,
                reason: "connection closed".to_string(),
                generation,
            });
        }
        self.notify(UpstreamEvent::Disconnected { url, generation });
    }

    fn handle_settled(&self, generation: u64) {
        let url = {
            let state = self.state.lock();
            match &state.session {
                Some(s) if s.generation == generation => state.address.clone().unwrap_or_default(),
                _ => return,
            }
        };
        self.notify(UpstreamEvent::Settled { url });
    }
}

impl UpstreamSubscriber for UpstreamLink {
    fn open(&self, id: &str, filters: Vec<Filter>) -> Result<(), LinkError> {
        self.subscribe(id, filters)
    }

    fn close(&self, id: &str) {
        self.unsubscribe(id);
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::community::AddressTag;
    use crate::upstream::resolver::ResolvedAddress;
    use async_trait::async_trait;
    use std::collections::HashMap;

    /// Remote half of a fake connection
    struct RemoteEnd {
        url: String,
        from_link: mpsc::UnboundedReceiver<ClientMessage>,
        to_link: mpsc::UnboundedSender<RelayMessage>,
    }

    struct FakeConnector {
        remotes: mpsc::UnboundedSender<RemoteEnd>,
    }

    #[async_trait]
    impl RelayConnector for FakeConnector {
        async fn connect(&self, url: &str) -> Result<Connection, ConnectError> {
            let (outbound, from_link) = mpsc::unbounded_channel();
            let (to_link, inbound) = mpsc::unbounded_channel();
            self.remotes
                .send(RemoteEnd {
                    url: url.to_string(),
                    from_link,
                    to_link,
                })
                .map_err(|_| ConnectError::WebSocket("test over".to_string()))?;
            Ok(Connection { outbound, inbound })
        }
    }

    struct FakeResolver {
        table: HashMap<String, ResolvedAddress>,
    }

    #[async_trait]
    impl AddressResolver for FakeResolver {
        async fn resolve(&self, tunnel: &str) -> Result<ResolvedAddress, ResolutionError> {
            self.table
                .get(tunnel)
                .cloned()
                .ok_or_else(|| ResolutionError(format!("unknown tunnel {}", tunnel)))
        }
    }

    struct Harness {
        link: UpstreamLink,
        remotes: mpsc::UnboundedReceiver<RemoteEnd>,
        observer: mpsc::UnboundedReceiver<UpstreamEvent>,
    }

    fn harness(addresses: Vec<AddressTag>) -> Harness {
        let mut table = HashMap::new();
        table.insert("goodtunnel".to_string(), ResolvedAddress::new("127.0.0.1", 4444));
        let (remote_tx, remotes) = mpsc::unbounded_channel();
        let (observer_tx, observer) = mpsc::unbounded_channel();
        let link = UpstreamLink::new(
            CommunityDefinition::new("owner", addresses),
            Arc::new(FakeResolver { table }),
            Arc::new(FakeConnector { remotes: remote_tx }),
            observer_tx,
        );
        Harness {
            link,
            remotes,
            observer,
        }
    }

    fn direct(url: &str) -> AddressTag {
        AddressTag::Direct {
            url: url.to_string(),
        }
    }

    fn tunnel(address: &str) -> AddressTag {
        AddressTag::Tunnel {
            address: address.to_string(),
            transport: "hyper".to_string(),
        }
    }

    fn event(id: &str) -> Event {
        Event {
            id: id.to_string(),
            pubkey: "pk".to_string(),
            created_at: 1,
            kind: 9,
            tags: Vec::new(),
            content: String::new(),
            sig: String::new(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_direct_and_settle() {
        let mut h = harness(vec![direct("wss://relay.example.com")]);

        h.link.connect().await.unwrap();
        assert!(h.link.is_connected());
        assert_eq!(h.link.address().as_deref(), Some("wss://relay.example.com"));

        let remote = h.remotes.recv().await.unwrap();
        assert_eq!(remote.url, "wss://relay.example.com");

        let settled = h.observer.recv().await.unwrap();
        assert_eq!(
            settled,
            UpstreamEvent::Settled {
                url: "wss://relay.example.com".to_string()
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_twice_reuses_session() {
        let mut h = harness(vec![direct("ws://relay.example.com")]);
        h.link.connect().await.unwrap();
        h.link.connect().await.unwrap();

        assert!(h.remotes.recv().await.is_some());
        assert!(h.remotes.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_direct_url_takes_precedence_over_tunnel() {
        let mut h = harness(vec![tunnel("unresolvable"), direct("ws://relay.example.com")]);
        h.link.connect().await.unwrap();
        assert_eq!(h.remotes.recv().await.unwrap().url, "ws://relay.example.com");
    }

    #[tokio::test(start_paused = true)]
    async fn test_tunnel_address_is_resolved() {
        let mut h = harness(vec![tunnel("goodtunnel")]);
        h.link.connect().await.unwrap();
        assert_eq!(h.remotes.recv().await.unwrap().url, "ws://127.0.0.1:4444/");
        assert_eq!(h.link.address().as_deref(), Some("ws://127.0.0.1:4444/"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unresolvable_tunnel_fails_without_connection() {
        let h = harness(vec![tunnel("unresolvable")]);

        let result = h.link.connect().await;
        match result {
            Err(LinkError::AddressResolution(AddressResolutionError::Tunnel { address, .. })) => {
                assert_eq!(address, "unresolvable");
            }
            other => panic!("Wrong result: {:?}", other.err()),
        }
        assert!(!h.link.is_connected());
        assert!(h.link.address().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_address_fails() {
        let h = harness(Vec::new());
        assert!(matches!(
            h.link.connect().await,
            Err(LinkError::AddressResolution(AddressResolutionError::NoAddress { .. }))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_websocket_direct_url_is_rejected() {
        let h = harness(vec![direct("wsx://relay.example.com")]);
        assert!(matches!(
            h.link.connect().await,
            Err(LinkError::AddressResolution(AddressResolutionError::InvalidUrl { .. }))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_preserves_call_order() {
        let mut h = harness(vec![direct("ws://relay.example.com")]);
        h.link.connect().await.unwrap();
        let mut remote = h.remotes.recv().await.unwrap();

        for id in ["e1", "e2", "e3"] {
            h.link.publish(&event(id));
        }

        for id in ["e1", "e2", "e3"] {
            match remote.from_link.recv().await.unwrap() {
                ClientMessage::Event(e) => assert_eq!(e.id, id),
                other => panic!("Wrong message type: {}", other.message_type()),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_when_disconnected_is_dropped() {
        let h = harness(vec![direct("ws://relay.example.com")]);
        h.link.publish(&event("e1"));
        assert!(!h.link.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscription_events_are_routed() {
        let mut h = harness(vec![direct("ws://relay.example.com")]);
        h.link.connect().await.unwrap();
        let mut remote = h.remotes.recv().await.unwrap();

        h.link
            .subscribe("channel-a-sync", vec![Filter::new().kinds([9])])
            .unwrap();
        assert!(matches!(
            remote.from_link.recv().await.unwrap(),
            ClientMessage::Req { id, .. } if id == "channel-a-sync"
        ));

        remote
            .to_link
            .send(RelayMessage::Event {
                subscription: "stranger".to_string(),
                event: event("ignored"),
            })
            .unwrap();
        remote
            .to_link
            .send(RelayMessage::Event {
                subscription: "channel-a-sync".to_string(),
                event: event("e1"),
            })
            .unwrap();

        let received = h.observer.recv().await.unwrap();
        assert_eq!(
            received,
            UpstreamEvent::Event {
                subscription: "channel-a-sync".to_string(),
                event: event("e1"),
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsubscribe_sends_close() {
        let mut h = harness(vec![direct("ws://relay.example.com")]);
        h.link.connect().await.unwrap();
        let mut remote = h.remotes.recv().await.unwrap();

        h.link.subscribe("sub", Vec::new()).unwrap();
        assert!(h.link.unsubscribe("sub"));
        assert!(!h.link.unsubscribe("sub"));

        assert!(matches!(remote.from_link.recv().await, Some(ClientMessage::Req { .. })));
        assert_eq!(
            remote.from_link.recv().await,
            Some(ClientMessage::Close("sub".to_string()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_requires_connection() {
        let h = harness(vec![direct("ws://relay.example.com")]);
        assert!(matches!(
            h.link.subscribe("sub", Vec::new()),
            Err(LinkError::NotConnected)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_close_clears_session() {
        let mut h = harness(vec![direct("ws://relay.example.com")]);
        h.link.connect().await.unwrap();
        let remote = h.remotes.recv().await.unwrap();
        h.link.subscribe("metadata-sync", Vec::new()).unwrap();

        drop(remote);

        assert_eq!(
            h.observer.recv().await.unwrap(),
            UpstreamEvent::SubscriptionClosed {
                subscription: "metadata-sync".to_string(),
                reason: "connection closed".to_string(),
                generation: 1,
            }
        );
        assert_eq!(
            h.observer.recv().await.unwrap(),
            UpstreamEvent::Disconnected {
                url: "ws://relay.example.com".to_string(),
                generation: 1,
            }
        );
        assert!(!h.link.is_connected());
        assert_eq!(h.link.session_generation(), None);

        // Reconnection happens only on demand, under a new generation
        h.link.connect().await.unwrap();
        assert!(h.link.is_connected());
        assert_eq!(h.link.session_generation(), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_is_idempotent_and_silences_callbacks() {
        let mut h = harness(vec![direct("ws://relay.example.com")]);
        h.link.connect().await.unwrap();
        let mut remote = h.remotes.recv().await.unwrap();
        h.link.subscribe("sub", Vec::new()).unwrap();

        h.link.close();
        h.link.close();
        assert!(!h.link.is_connected());

        let _ = remote.to_link.send(RelayMessage::Event {
            subscription: "sub".to_string(),
            event: event("late"),
        });
        tokio::time::sleep(METADATA_SETTLE_DELAY * 2).await;

        assert!(h.observer.try_recv().is_err());

        // Outbound queue is dropped with the session
        assert!(matches!(remote.from_link.recv().await, Some(ClientMessage::Req { .. })));
        assert!(remote.from_link.recv().await.is_none());
    }
}
