// Satellite Core — relay bridging and operator control
//
// Keeps hosted communities linked to their upstream relays, forwards events
// in both directions, fans direct messages out to recipient relays, and runs
// the authenticated control channel operators use to drive the node.

pub mod bridge;
pub mod community;
pub mod control;
pub mod dm;
pub mod event;
pub mod fanout;
pub mod store;
pub mod sync;
pub mod upstream;

pub use bridge::{
    ActiveSubscription, RelayBridge, UpstreamStatusSink, METADATA_KINDS, METADATA_SUBSCRIPTION_ID,
};
pub use community::{AddressTag, CommunityDefinition};
pub use control::{
    register_builtin_actions, register_dm_actions, ActionHandler, ConfigStore, ControlChannel,
    ControlError, CredentialCheck, FileConfigStore, NodeConfig, StatusPatch, StatusSnapshot,
    UnauthorizedError,
};
pub use dm::{
    DirectMessageForwarder, DirectMessageStats, RelayDirectory, StoreRelayDirectory,
    COMMON_CONTACT_RELAY,
};
pub use event::{Event, Filter, KIND_ENCRYPTED_DM};
pub use fanout::{
    DeliveryFailedError, DeliveryReport, FanoutForwarder, ForwardResult, ForwardStatus,
    PublishError, Publisher, RelayPool,
};
pub use store::{EventStore, MemoryEventStore, StoreError};
pub use sync::{ChannelSyncEngine, UpstreamSubscriber};
pub use upstream::{
    AddressResolutionError, AddressResolver, LinkError, NoTunnelResolver, ResolvedAddress,
    UpstreamEvent, UpstreamLink, WebSocketConnector,
};
