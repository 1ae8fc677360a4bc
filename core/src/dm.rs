// Direct-message routing
//
// Encrypted DMs written by the node owner are pushed to each recipient's
// inbox relays, plus the common contact relay and any relays the operator
// configured. Owner and configured relays follow `config:updated`.

use crate::control::{ConfigStore, NodeConfig};
use crate::event::{Event, KIND_ENCRYPTED_DM};
use crate::fanout::{DeliveryFailedError, FanoutForwarder};
use crate::store::EventStore;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Relay most clients publish contact and relay lists to
pub const COMMON_CONTACT_RELAY: &str = "wss://purplepag.es";

/// Relay list metadata
pub const KIND_RELAY_LIST: u32 = 10002;

/// Looks up where a pubkey reads its messages
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RelayDirectory: Send + Sync {
    async fn inbox_relays(&self, pubkey: &str) -> Vec<String>;
}

/// Reads inbox relays from the newest stored relay list
///
/// `["r", url]` and `["r", url, "read"]` are inboxes; write-only entries are
/// skipped.
pub struct StoreRelayDirectory {
    store: Arc<dyn EventStore>,
}

impl StoreRelayDirectory {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl RelayDirectory for StoreRelayDirectory {
    async fn inbox_relays(&self, pubkey: &str) -> Vec<String> {
        let Some(list) = self.store.latest(KIND_RELAY_LIST, pubkey) else {
            debug!(pubkey = %pubkey, "No relay list stored");
            return Vec::new();
        };
        list.tags
            .iter()
            .filter(|t| t.first().map(String::as_str) == Some("r"))
            .filter(|t| matches!(t.get(2).map(String::as_str), None | Some("read")))
            .filter_map(|t| t.get(1).cloned())
            .collect()
    }
}

/// Delivery counters for one owner
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectMessageStats {
    /// Messages at least one relay accepted
    pub forwarded: u64,
    /// Messages no relay accepted
    pub failed: u64,
    /// Successful relay deliveries across all messages
    pub relays_reached: u64,
}

pub struct DirectMessageForwarder {
    forwarder: FanoutForwarder,
    directory: Arc<dyn RelayDirectory>,
    owner: RwLock<Option<String>>,
    extra_relays: RwLock<Vec<String>>,
    stats: Mutex<HashMap<String, DirectMessageStats>>,
}

impl DirectMessageForwarder {
    pub fn new(forwarder: FanoutForwarder, directory: Arc<dyn RelayDirectory>) -> Self {
        Self {
            forwarder,
            directory,
            owner: RwLock::new(None),
            extra_relays: RwLock::new(Vec::new()),
            stats: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_owner(&self, owner: Option<String>) {
        *self.owner.write() = owner;
    }

    pub fn set_extra_relays(&self, relays: Vec<String>) {
        *self.extra_relays.write() = relays;
    }

    /// Owner plus the contact relay and every configured relay
    pub fn apply_config(&self, config: &NodeConfig) {
        let mut relays = vec![COMMON_CONTACT_RELAY.to_string()];
        relays.extend(config.relays.iter().map(|r| r.url.clone()));
        debug!(owner = ?config.owner, relays = relays.len(), "Applying DM config");
        self.set_owner(config.owner.clone());
        self.set_extra_relays(relays);
    }

    /// Apply the current config, then every `config:updated`
    pub fn watch_config(self: &Arc<Self>, config: &dyn ConfigStore) -> JoinHandle<()> {
        let mut updates = config.subscribe();
        self.apply_config(&config.get());
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                match updates.recv().await {
                    Ok(config) => match weak.upgrade() {
                        Some(forwarder) => forwarder.apply_config(&config),
                        None => return,
                    },
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Config updates lagged");
                    }
                    Err(RecvError::Closed) => return,
                }
            }
        })
    }

    /// Owner-signed encrypted DMs only
    pub fn should_forward(&self, event: &Event) -> bool {
        event.kind == KIND_ENCRYPTED_DM
            && self.owner.read().as_deref() == Some(event.pubkey.as_str())
    }

    /// Inbox relays of every `p` recipient, then extra relays, without repeats
    pub async fn destinations(&self, event: &Event) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();

        let recipients: Vec<String> = event.tag_values("p").map(str::to_string).collect();
        for recipient in recipients {
            for relay in self.directory.inbox_relays(&recipient).await {
                if seen.insert(relay.clone()) {
                    out.push(relay);
                }
            }
        }
        let extra = self.extra_relays.read().clone();
        for relay in extra {
            if seen.insert(relay.clone()) {
                out.push(relay);
            }
        }
        out
    }

    /// Forward `event` and return the delivery summary
    pub async fn forward_message(&self, event: &Event) -> Result<String, DeliveryFailedError> {
        let destinations = self.destinations(event).await;
        debug!(event_id = %event.id, relays = destinations.len(), "Forwarding direct message");
        let result = self.forwarder.forward(event, &destinations).await;

        let mut stats = self.stats.lock();
        let entry = stats.entry(event.pubkey.clone()).or_default();
        match &result {
            Ok(report) => {
                entry.forwarded += 1;
                entry.relays_reached += report.succeeded() as u64;
            }
            Err(_) => entry.failed += 1,
        }
        drop(stats);

        Ok(result?.summary())
    }

    /// `None` when the event is not ours to forward
    pub async fn handle_local_event(
        &self,
        event: &Event,
    ) -> Option<Result<String, DeliveryFailedError>> {
        if !self.should_forward(event) {
            return None;
        }
        let result = self.forward_message(event).await;
        if let Err(e) = &result {
            warn!(event_id = %event.id, "Failed to forward message: {}", e);
        }
        Some(result)
    }

    /// Counters for DMs signed by `owner`
    pub fn stats(&self, owner: &str) -> DirectMessageStats {
        self.stats.lock().get(owner).cloned().unwrap_or_default()
    }
}
