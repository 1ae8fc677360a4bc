//! Channel Sync: one upstream subscription per channel local clients ask for
//!
//! Local clients open and close subscriptions far more often than it is
//! worth churning upstream. The engine keys upstream subscriptions by channel,
//! so any number of local subscriptions naming the same channel share one.

use crate::event::Filter;
use crate::upstream::LinkError;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info};

/// Event kinds synced for a channel
pub const CHANNEL_MESSAGE_KINDS: [u32; 4] = [9, 10, 11, 12];

/// Tag carrying the channel identifier
pub const CHANNEL_TAG: &str = "h";

/// Where channel subscriptions are opened
pub trait UpstreamSubscriber: Send + Sync {
    /// Request-and-forget; must not suspend
    fn open(&self, id: &str, filters: Vec<Filter>) -> Result<(), LinkError>;
    fn close(&self, id: &str);
}

/// Upstream subscription id for `channel`
pub fn channel_subscription_id(channel: &str) -> String {
    format!("channel-{}-sync", channel)
}

/// Filter synced upstream for `channel`
pub fn channel_filter(channel: &str) -> Filter {
    Filter::new()
        .kinds(CHANNEL_MESSAGE_KINDS)
        .tag(CHANNEL_TAG, vec![channel.to_string()])
}

/// Channels referenced by any filter's channel tag
pub fn channels_in(filters: &[Filter]) -> BTreeSet<String> {
    filters
        .iter()
        .filter_map(|f| f.tag_values(CHANNEL_TAG))
        .flatten()
        .cloned()
        .collect()
}

pub struct ChannelSyncEngine {
    upstream: Arc<dyn UpstreamSubscriber>,
    /// Channels wanted by each local subscription
    demand: HashMap<String, BTreeSet<String>>,
    /// Channel → open upstream subscription id
    open: BTreeMap<String, String>,
}

impl ChannelSyncEngine {
    pub fn new(upstream: Arc<dyn UpstreamSubscriber>) -> Self {
        Self {
            upstream,
            demand: HashMap::new(),
            open: BTreeMap::new(),
        }
    }

    /// A local subscription was created or its filters replaced
    pub fn on_subscription_changed(&mut self, subscription_id: &str, filters: &[Filter]) {
        let channels = channels_in(filters);
        if channels.is_empty() {
            self.demand.remove(subscription_id);
        } else {
            self.demand.insert(subscription_id.to_string(), channels);
        }
        self.reconcile();
    }

    /// A local subscription went away
    pub fn on_subscription_removed(&mut self, subscription_id: &str) {
        if self.demand.remove(subscription_id).is_some() {
            self.reconcile();
        }
    }

    /// Union of channels across all local subscriptions
    pub fn desired_channels(&self) -> BTreeSet<String> {
        self.demand.values().flatten().cloned().collect()
    }

    /// Close what nobody references, open what is referenced but missing
    pub fn reconcile(&mut self) {
        let desired = self.desired_channels();

        let stale: Vec<String> = self
            .open
            .keys()
            .filter(|c| !desired.contains(*c))
            .cloned()
            .collect();
        for channel in stale {
            if let Some(id) = self.open.remove(&channel) {
                info!(channel = %channel, "Closing channel sync");
                self.upstream.close(&id);
            }
        }

        for channel in desired {
            if self.open.contains_key(&channel) {
                continue;
            }
            let id = channel_subscription_id(&channel);
            match self.upstream.open(&id, vec![channel_filter(&channel)]) {
                Ok(()) => {
                    info!(channel = %channel, "Opening subscription to sync channel");
                    self.open.insert(channel, id);
                }
                Err(e) => {
                    debug!(channel = %channel, "Deferring channel sync: {}", e);
                }
            }
        }
    }

    /// The upstream ended `subscription_id`; returns the channel it served
    pub fn on_upstream_closed(&mut self, subscription_id: &str) -> Option<String> {
        let channel = self
            .open
            .iter()
            .find(|(_, id)| id.as_str() == subscription_id)
            .map(|(c, _)| c.clone())?;
        self.open.remove(&channel);
        Some(channel)
    }

    /// Forget every upstream subscription without closing (the link is gone)
    pub fn reset(&mut self) {
        self.open.clear();
    }

    /// Close every upstream channel subscription
    pub fn close_all(&mut self) {
        for (_, id) in std::mem::take(&mut self.open) {
            self.upstream.close(&id);
        }
    }

    pub fn subscription_for(&self, channel: &str) -> Option<&str> {
        self.open.get(channel).map(String::as_str)
    }

    pub fn open_channels(&self) -> Vec<String> {
        self.open.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Open(String),
        Close(String),
    }

    struct Recorder {
        connected: AtomicBool,
        calls: Mutex<Vec<Call>>,
    }

    impl Recorder {
        fn new(connected: bool) -> Arc<Self> {
            Arc::new(Self {
                connected: AtomicBool::new(connected),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().clone()
        }
    }

    impl UpstreamSubscriber for Recorder {
        fn open(&self, id: &str, filters: Vec<Filter>) -> Result<(), LinkError> {
            if !self.connected.load(Ordering::SeqCst) {
                return Err(LinkError::NotConnected);
            }
            assert_eq!(filters.len(), 1);
            assert_eq!(filters[0].kinds.as_deref(), Some(&CHANNEL_MESSAGE_KINDS[..]));
            self.calls.lock().push(Call::Open(id.to_string()));
            Ok(())
        }

        fn close(&self, id: &str) {
            self.calls.lock().push(Call::Close(id.to_string()));
        }
    }

    fn channels(names: &[&str]) -> Vec<Filter> {
        vec![Filter::new()
            .kinds([9])
            .tag("h", names.iter().map(|s| s.to_string()))]
    }

    fn open(c: &str) -> Call {
        Call::Open(channel_subscription_id(c))
    }

    fn close(c: &str) -> Call {
        Call::Close(channel_subscription_id(c))
    }

    #[test]
    fn test_channels_in_ignores_filters_without_channel_tag() {
        let filters = vec![
            Filter::new().kinds([0]),
            Filter::new().tag("h", vec!["b".to_string(), "a".to_string()]),
            Filter::new().tag("p", vec!["someone".to_string()]),
            Filter::new().tag("h", vec!["a".to_string()]),
        ];
        let found: Vec<String> = channels_in(&filters).into_iter().collect();
        assert_eq!(found, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_channel_set_change_opens_and_closes_by_channel() {
        let recorder = Recorder::new(true);
        let mut engine = ChannelSyncEngine::new(recorder.clone());

        engine.on_subscription_changed("client-1", &channels(&["A", "B"]));
        assert_eq!(engine.open_channels(), vec!["A".to_string(), "B".to_string()]);
        assert_eq!(recorder.calls(), vec![open("A"), open("B")]);

        engine.on_subscription_changed("client-1", &channels(&["B", "C"]));
        assert_eq!(engine.open_channels(), vec!["B".to_string(), "C".to_string()]);
        // B untouched: neither closed nor reopened
        assert_eq!(
            recorder.calls(),
            vec![open("A"), open("B"), close("A"), open("C")]
        );
        assert_eq!(engine.subscription_for("B"), Some("channel-B-sync"));
    }

    #[test]
    fn test_unchanged_channel_set_is_noop() {
        let recorder = Recorder::new(true);
        let mut engine = ChannelSyncEngine::new(recorder.clone());

        engine.on_subscription_changed("client-1", &channels(&["A"]));
        engine.on_subscription_changed("client-1", &channels(&["A"]));
        engine.on_subscription_changed("client-2", &channels(&["A"]));

        assert_eq!(recorder.calls(), vec![open("A")]);
    }

    #[test]
    fn test_channel_shared_by_two_subscriptions_stays_open() {
        let recorder = Recorder::new(true);
        let mut engine = ChannelSyncEngine::new(recorder.clone());

        engine.on_subscription_changed("client-1", &channels(&["A"]));
        engine.on_subscription_changed("client-2", &channels(&["A", "B"]));
        engine.on_subscription_removed("client-2");

        assert_eq!(engine.open_channels(), vec!["A".to_string()]);
        assert_eq!(recorder.calls(), vec![open("A"), open("B"), close("B")]);

        engine.on_subscription_changed("client-1", &[Filter::new().kinds([1])]);
        assert!(engine.open_channels().is_empty());
    }

    #[test]
    fn test_upstream_close_allows_clean_reopen() {
        let recorder = Recorder::new(true);
        let mut engine = ChannelSyncEngine::new(recorder.clone());

        engine.on_subscription_changed("client-1", &channels(&["A"]));
        assert_eq!(
            engine.on_upstream_closed("channel-A-sync"),
            Some("A".to_string())
        );
        assert!(engine.on_upstream_closed("channel-A-sync").is_none());
        assert!(engine.open_channels().is_empty());

        engine.on_subscription_changed("client-1", &channels(&["A"]));
        assert_eq!(recorder.calls(), vec![open("A"), open("A")]);
    }

    #[test]
    fn test_disconnected_upstream_defers_until_reconcile() {
        let recorder = Recorder::new(false);
        let mut engine = ChannelSyncEngine::new(recorder.clone());

        engine.on_subscription_changed("client-1", &channels(&["A"]));
        assert!(engine.open_channels().is_empty());
        assert!(recorder.calls().is_empty());

        recorder.connected.store(true, Ordering::SeqCst);
        engine.reconcile();
        assert_eq!(recorder.calls(), vec![open("A")]);
    }

    proptest::proptest! {
        #[test]
        fn prop_open_set_tracks_demand(
            steps in proptest::collection::vec(
                (0usize..3, proptest::collection::btree_set("[a-d]", 0..4)),
                1..24,
            )
        ) {
            let recorder = Recorder::new(true);
            let mut engine = ChannelSyncEngine::new(recorder.clone());

            for (client, set) in steps {
                let names: Vec<&str> = set.iter().map(String::as_str).collect();
                engine.on_subscription_changed(&format!("client-{}", client), &channels(&names));

                let open: BTreeSet<String> = engine.open_channels().into_iter().collect();
                proptest::prop_assert_eq!(&open, &engine.desired_channels());
            }

            // Never two live subscriptions for one channel
            let mut live = BTreeSet::new();
            for call in recorder.calls() {
                let consistent = match call {
                    Call::Open(id) => live.insert(id),
                    Call::Close(id) => live.remove(&id),
                };
                proptest::prop_assert!(consistent);
            }
        }
    }

    #[test]
    fn test_close_all_and_reset() {
        let recorder = Recorder::new(true);
        let mut engine = ChannelSyncEngine::new(recorder.clone());

        engine.on_subscription_changed("client-1", &channels(&["A", "B"]));
        engine.close_all();
        assert!(engine.open_channels().is_empty());
        assert_eq!(
            recorder.calls(),
            vec![open("A"), open("B"), close("A"), close("B")]
        );

        engine.reconcile();
        engine.reset();
        assert!(engine.open_channels().is_empty());
        // reset forgets without sending CLOSE
        assert_eq!(recorder.calls().len(), 6);
    }
}
