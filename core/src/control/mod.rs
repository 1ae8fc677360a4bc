//! The operator-facing side of the node
//!
//! Operator sockets send `["CONTROL", token, action, payload]` frames. Every
//! frame is checked against the credential predicate before its action runs,
//! and only authorized sockets receive broadcasts. Database status updates
//! are debounced so bursts of inserts produce at most one update per window.

pub mod actions;
pub mod config;
pub mod debounce;
pub mod message;
pub mod status;

pub use actions::{
    register_builtin_actions, register_dm_actions, ActionHandler, DirectMessageAction,
    SetConfigAction, SyncAction,
};
pub use config::{ConfigError, ConfigStore, FileConfigStore, NodeConfig, RelayEntry};
pub use debounce::{StatusDebouncer, Trigger};
pub use message::{
    parse_frame, BroadcastType, ControlBroadcast, ControlMessage, FrameError, CONTROL_TAG,
};
pub use status::{StatusPatch, StatusSnapshot};

use crate::bridge::UpstreamStatusSink;
use crate::event::Event;
use crate::store::EventStore;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub type ConnectionId = u64;

/// Decides whether an auth token is valid
pub type CredentialCheck = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Minimum spacing between database status updates
pub const STATUS_DEBOUNCE: Duration = Duration::from_millis(1000);

/// Longest content preview in event log lines
pub const PREVIEW_LIMIT: usize = 256;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Connection {connection} is not authorized")]
pub struct UnauthorizedError {
    pub connection: ConnectionId,
}

#[derive(Debug, Error)]
pub enum ControlError {
    #[error(transparent)]
    Unauthorized(#[from] UnauthorizedError),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// One operator socket
#[derive(Debug)]
pub struct ControlConnection {
    pub id: ConnectionId,
    sender: mpsc::UnboundedSender<String>,
    pub authorized: bool,
}

struct ControlInner {
    config: Arc<dyn ConfigStore>,
    store: Arc<dyn EventStore>,
    credentials: CredentialCheck,
    connections: Mutex<HashMap<ConnectionId, ControlConnection>>,
    next_connection: AtomicU64,
    handlers: RwLock<HashMap<String, Arc<dyn ActionHandler>>>,
    status: Mutex<StatusSnapshot>,
    debouncer: Mutex<StatusDebouncer>,
    timer: Mutex<Option<JoinHandle<()>>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

/// Shared handle; clones refer to the same channel
#[derive(Clone)]
pub struct ControlChannel {
    inner: Arc<ControlInner>,
}

/// `abcdefgh...` form of a pubkey
fn short_name(pubkey: &str) -> String {
    let prefix: String = pubkey.chars().take(8).collect();
    format!("{}...", prefix)
}

fn preview(content: &str) -> String {
    content.chars().take(PREVIEW_LIMIT).collect()
}

/// `[CONFIG] K1 = V1 | K2 = V2`
fn config_log_line(patch: &Map<String, Value>) -> String {
    let pairs: Vec<String> = patch
        .iter()
        .map(|(key, value)| format!("{} = {}", key, value).to_uppercase())
        .collect();
    format!("[CONFIG] {}", pairs.join(" | "))
}

impl ControlChannel {
    pub fn new(
        config: Arc<dyn ConfigStore>,
        store: Arc<dyn EventStore>,
        credentials: CredentialCheck,
    ) -> Self {
        Self {
            inner: Arc::new(ControlInner {
                config,
                store,
                credentials,
                connections: Mutex::new(HashMap::new()),
                next_connection: AtomicU64::new(1),
                handlers: RwLock::new(HashMap::new()),
                status: Mutex::new(StatusSnapshot::default()),
                debouncer: Mutex::new(StatusDebouncer::new(STATUS_DEBOUNCE)),
                timer: Mutex::new(None),
                watcher: Mutex::new(None),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    fn from_inner(inner: Arc<ControlInner>) -> Self {
        Self { inner }
    }

    pub fn register_handler(&self, action: &str, handler: impl ActionHandler + 'static) {
        self.inner
            .handlers
            .write()
            .insert(action.to_string(), Arc::new(handler));
    }

    // ------------------------------------------------------------------
    // Connections
    // ------------------------------------------------------------------

    /// Register a socket. It starts unauthorized.
    pub fn connect(&self, sender: mpsc::UnboundedSender<String>) -> ConnectionId {
        let id = self.inner.next_connection.fetch_add(1, Ordering::SeqCst);
        self.inner.connections.lock().insert(
            id,
            ControlConnection {
                id,
                sender,
                authorized: false,
            },
        );
        debug!(connection = id, "Control connection opened");
        id
    }

    pub fn disconnect(&self, id: ConnectionId) {
        if self.inner.connections.lock().remove(&id).is_some() {
            debug!(connection = id, "Control connection closed");
        }
    }

    /// Promote a connection without a token check
    pub fn authorize(&self, id: ConnectionId) -> bool {
        match self.inner.connections.lock().get_mut(&id) {
            Some(connection) => {
                connection.authorized = true;
                true
            }
            None => false,
        }
    }

    pub fn is_authorized(&self, id: ConnectionId) -> bool {
        self.inner
            .connections
            .lock()
            .get(&id)
            .map(|c| c.authorized)
            .unwrap_or(false)
    }

    pub fn connection_count(&self) -> usize {
        self.inner.connections.lock().len()
    }

    // ------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------

    /// Handle a raw frame from connection `id`; non-control frames are ignored
    pub fn handle_message(&self, id: ConnectionId, text: &str) -> Result<(), ControlError> {
        match parse_frame(text)? {
            Some(message) => Ok(self.handle_control_message(id, message)?),
            None => Ok(()),
        }
    }

    pub fn handle_control_message(
        &self,
        id: ConnectionId,
        message: ControlMessage,
    ) -> Result<(), UnauthorizedError> {
        let valid = (self.inner.credentials)(&message.auth_token);
        {
            let mut connections = self.inner.connections.lock();
            let connection = connections
                .get_mut(&id)
                .ok_or(UnauthorizedError { connection: id })?;
            connection.authorized = valid;
        }
        if !valid {
            warn!(connection = id, action = %message.action, "Rejected control message");
            return Err(UnauthorizedError { connection: id });
        }
        self.dispatch(id, &message.action, message.payload);
        Ok(())
    }

    /// Run the handler for `action` sent by `origin`. Unknown actions do nothing.
    pub fn dispatch(&self, origin: ConnectionId, action: &str, payload: Value) {
        let handler = self.inner.handlers.read().get(action).cloned();
        let Some(handler) = handler else {
            debug!(action = %action, "No handler for control action");
            return;
        };
        if let Err(e) = handler.handle(self, origin, payload) {
            warn!(action = %action, "Control action failed: {:#}", e);
        }
    }

    // ------------------------------------------------------------------
    // State
    // ------------------------------------------------------------------

    pub fn config(&self) -> NodeConfig {
        self.inner.config.get()
    }

    pub fn status(&self) -> StatusSnapshot {
        self.inner.status.lock().clone()
    }

    pub fn set_config(&self, patch: Map<String, Value>) -> Result<(), ConfigError> {
        self.inner.config.merge(&patch)?;
        let line = config_log_line(&patch);
        self.broadcast(ControlBroadcast::new(
            BroadcastType::ConfigSet,
            Value::Object(patch),
        ));
        self.log(&line);
        Ok(())
    }

    pub fn set_status(&self, patch: StatusPatch) {
        patch.apply(&mut self.inner.status.lock());
        let data = serde_json::to_value(&patch).unwrap_or(Value::Null);
        self.broadcast(ControlBroadcast::new(BroadcastType::StatusSet, data));
    }

    /// Send to every authorized connection
    pub fn broadcast(&self, payload: ControlBroadcast) {
        let frame = match payload.to_frame() {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Failed to encode control broadcast: {}", e);
                return;
            }
        };
        let connections = self.inner.connections.lock();
        for connection in connections.values().filter(|c| c.authorized) {
            if connection.sender.send(frame.clone()).is_err() {
                debug!(connection = connection.id, "Control socket gone");
            }
        }
    }

    /// Send a raw frame to one connection; false when it is gone
    pub fn send_to(&self, id: ConnectionId, frame: String) -> bool {
        match self.inner.connections.lock().get(&id) {
            Some(connection) => connection.sender.send(frame).is_ok(),
            None => false,
        }
    }

    /// Mirror a line to operators (when enabled) and to tracing
    pub fn log(&self, text: &str) {
        info!("{}", text);
        if !self.config().logs_enabled {
            return;
        }
        self.broadcast(ControlBroadcast::new(
            BroadcastType::LogsRemote,
            json!({
                "id": uuid::Uuid::new_v4().to_string(),
                "text": text,
            }),
        ));
    }

    /// Full config then full status, then a greeting line
    pub fn sync(&self) {
        self.broadcast(ControlBroadcast::new(
            BroadcastType::ConfigSet,
            self.config().to_value(),
        ));

        let mut status = serde_json::to_value(self.status()).unwrap_or_else(|_| json!({}));
        if let Value::Object(fields) = &mut status {
            fields.insert("synced".to_string(), Value::Bool(true));
        }
        self.broadcast(ControlBroadcast::new(BroadcastType::StatusSet, status));
        self.log("[control] SATELLITE NODE CONNECTION ESTABLISHED");
    }

    /// Record an upstream relay's connection state
    pub fn relay_status(&self, url: &str, connected: bool) {
        let relays = {
            let status = self.inner.status.lock();
            if status.relays_connected.get(url) == Some(&connected) {
                return;
            }
            let mut relays = status.relays_connected.clone();
            relays.insert(url.to_string(), connected);
            relays
        };
        self.set_status(StatusPatch {
            relays_connected: Some(relays),
            ..StatusPatch::default()
        });
        let state = if connected { "CONNECTED" } else { "DISCONNECTED" };
        self.log(&format!("[STATUS] REMOTE {} {}", state, url));
    }

    // ------------------------------------------------------------------
    // Database status
    // ------------------------------------------------------------------

    pub fn on_event_inserted(&self, event: &Event) {
        if self.inner.stopped.load(Ordering::SeqCst) {
            return;
        }
        let mut line = format!(
            "[EVENT] KIND {} FROM {}",
            event.kind,
            short_name(&event.pubkey)
        );
        if matches!(event.kind, 1 | 7) && !event.content.is_empty() {
            line.push_str(&format!(" \"{}\"", preview(&event.content)));
        }
        self.log(&line);

        let trigger = self.inner.debouncer.lock().on_event(Instant::now());
        match trigger {
            Trigger::Now => self.update_database_status(),
            Trigger::After(delay) => self.schedule_update(delay),
            Trigger::Skip => {}
        }
    }

    fn schedule_update(&self, delay: Duration) {
        let weak: Weak<ControlInner> = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                ControlChannel::from_inner(inner).update_database_status();
            }
        });
        if let Some(previous) = self.inner.timer.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Push db count and size when either changed
    pub fn update_database_status(&self) {
        self.inner.debouncer.lock().mark_updated(Instant::now());
        let count = self.inner.store.count();
        let size = self.inner.store.size();
        let changed = {
            let status = self.inner.status.lock();
            status.db_count != count || status.db_size != size
        };
        if changed {
            self.set_status(StatusPatch::database(count, size));
        }
    }

    /// Follow the store's insert notifications until `stop()`
    pub fn watch_inserted(&self) {
        let mut inserted = self.inner.store.subscribe_inserted();
        let weak = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            loop {
                match inserted.recv().await {
                    Ok(event) => match weak.upgrade() {
                        Some(inner) => ControlChannel::from_inner(inner).on_event_inserted(&event),
                        None => return,
                    },
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Insert notifications lagged");
                    }
                    Err(RecvError::Closed) => return,
                }
            }
        });
        if let Some(previous) = self.inner.watcher.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Cancel timers and watchers. Idempotent.
    pub fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(timer) = self.inner.timer.lock().take() {
            timer.abort();
        }
        self.inner.debouncer.lock().cancel();
        if let Some(watcher) = self.inner.watcher.lock().take() {
            watcher.abort();
        }
    }
}

impl UpstreamStatusSink for ControlChannel {
    fn relay_status(&self, url: &str, connected: bool) {
        ControlChannel::relay_status(self, url, connected);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryEventStore;

    fn channel() -> (ControlChannel, Arc<MemoryEventStore>) {
        let store = Arc::new(MemoryEventStore::new());
        let control = ControlChannel::new(
            Arc::new(FileConfigStore::in_memory(NodeConfig::default())),
            store.clone(),
            Arc::new(|token: &str| token == "secret"),
        );
        register_builtin_actions(&control);
        (control, store)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<String>) -> Vec<ControlBroadcast> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            out.push(ControlBroadcast::from_frame(&frame).unwrap());
        }
        out
    }

    #[test]
    fn test_short_name_and_config_line() {
        assert_eq!(short_name("abcdef0123456789"), "abcdef01...");
        assert_eq!(short_name("abc"), "abc...");

        let mut patch = Map::new();
        patch.insert("owner".to_string(), json!("abc"));
        patch.insert("cacheLevel".to_string(), json!(2));
        assert_eq!(
            config_log_line(&patch),
            r#"[CONFIG] OWNER = "ABC" | CACHELEVEL = 2"#
        );
    }

    #[test]
    fn test_failed_auth_clears_flag() {
        let (control, _) = channel();
        let (tx, _rx) = mpsc::unbounded_channel();
        let id = control.connect(tx);
        assert!(!control.is_authorized(id));

        control
            .handle_control_message(id, ControlMessage::new("secret", "NOPE", Value::Null))
            .unwrap();
        assert!(control.is_authorized(id));

        let err = control
            .handle_control_message(id, ControlMessage::new("wrong", "SYNC", Value::Null))
            .unwrap_err();
        assert_eq!(err, UnauthorizedError { connection: id });
        assert!(!control.is_authorized(id));
        assert_eq!(control.connection_count(), 1);
    }

    #[test]
    fn test_sync_sends_config_status_and_greeting() {
        let (control, _) = channel();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = control.connect(tx);
        control.handle_message(id, r#"["CONTROL","secret","SYNC",null]"#).unwrap();

        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].kind, BroadcastType::ConfigSet);
        assert_eq!(frames[0].data["relayPort"], json!(2012));
        assert_eq!(frames[1].kind, BroadcastType::StatusSet);
        assert_eq!(frames[1].data["synced"], json!(true));
        assert_eq!(frames[2].kind, BroadcastType::LogsRemote);
        assert_eq!(
            frames[2].data["text"],
            json!("[control] SATELLITE NODE CONNECTION ESTABLISHED")
        );
        assert!(frames[2].data["id"].as_str().is_some());
    }

    #[test]
    fn test_logs_respect_logs_enabled() {
        let (control, _) = channel();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = control.connect(tx);
        control.authorize(id);

        let mut patch = Map::new();
        patch.insert("logsEnabled".to_string(), json!(false));
        control.set_config(patch).unwrap();
        // config/set only; the log line is suppressed
        assert_eq!(drain(&mut rx).len(), 1);

        control.log("quiet");
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_relay_status_logs_transitions_only() {
        let (control, _) = channel();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = control.connect(tx);
        control.authorize(id);

        control.relay_status("wss://up.example.com", true);
        control.relay_status("wss://up.example.com", true);
        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 2);
        assert_eq!(
            frames[0].data,
            json!({"relaysConnected": {"wss://up.example.com": true}})
        );
        assert_eq!(
            frames[1].data["text"],
            json!("[STATUS] REMOTE CONNECTED wss://up.example.com")
        );

        control.relay_status("wss://up.example.com", false);
        assert!(!control.status().relays_connected["wss://up.example.com"]);
    }

    #[test]
    fn test_bad_frames_are_reported() {
        let (control, _) = channel();
        let (tx, _rx) = mpsc::unbounded_channel();
        let id = control.connect(tx);
        assert!(control.handle_message(id, r#"["REQ","x",{}]"#).is_ok());
        assert!(matches!(
            control.handle_message(id, "not json"),
            Err(ControlError::Frame(_))
        ));
    }
}
