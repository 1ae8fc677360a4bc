// Event storage seam
//
// Storage and querying belong to the host. The core only needs to hand events
// over, read coarse metrics, and hear about insertions.

use crate::event::Event;
use parking_lot::RwLock;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("Storage error: {0}")]
    Backend(String),
}

/// Local event storage collaborator
pub trait EventStore: Send + Sync {
    /// Store an event. `Ok(false)` means it was already present.
    fn add_event(&self, event: &Event) -> Result<bool, StoreError>;
    /// Number of stored events
    fn count(&self) -> u64;
    /// Storage footprint in bytes
    fn size(&self) -> u64;
    /// Newly inserted events
    fn subscribe_inserted(&self) -> broadcast::Receiver<Event>;
    /// Newest event of `kind` by `pubkey`
    fn latest(&self, kind: u32, pubkey: &str) -> Option<Event>;
}

/// In-memory storage keyed by event id
pub struct MemoryEventStore {
    events: RwLock<HashMap<String, Event>>,
    bytes: RwLock<u64>,
    inserted: broadcast::Sender<Event>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        let (inserted, _) = broadcast::channel(256);
        Self {
            events: RwLock::new(HashMap::new()),
            bytes: RwLock::new(0),
            inserted,
        }
    }

    pub fn get(&self, id: &str) -> Option<Event> {
        self.events.read().get(id).cloned()
    }
}

impl Default for MemoryEventStore {
    fn default() -> Self {
        Self::new()
    }
}

impl EventStore for MemoryEventStore {
    fn add_event(&self, event: &Event) -> Result<bool, StoreError> {
        let encoded =
            serde_json::to_vec(event).map_err(|e| StoreError::Backend(e.to_string()))?;
        {
            let mut events = self.events.write();
            if events.contains_key(&event.id) {
                return Ok(false);
            }
            events.insert(event.id.clone(), event.clone());
            *self.bytes.write() += encoded.len() as u64;
        }
        // No receivers is fine
        let _ = self.inserted.send(event.clone());
        Ok(true)
    }

    fn count(&self) -> u64 {
        self.events.read().len() as u64
    }

    fn size(&self) -> u64 {
        *self.bytes.read()
    }

    fn subscribe_inserted(&self) -> broadcast::Receiver<Event> {
        self.inserted.subscribe()
    }

    fn latest(&self, kind: u32, pubkey: &str) -> Option<Event> {
        self.events
            .read()
            .values()
            .filter(|e| e.kind == kind && e.pubkey == pubkey)
            .max_by_key(|e| e.created_at)
            .cloned()
    }
}
