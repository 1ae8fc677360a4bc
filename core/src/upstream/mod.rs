//! Upstream relays: links from hosted communities to their remote relays

pub mod connection;
pub mod link;
pub mod protocol;
pub mod resolver;

pub use connection::{ConnectError, Connection, RelayConnector, WebSocketConnector};
pub use link::{
    AddressResolutionError, LinkError, UpstreamEvent, UpstreamLink, METADATA_SETTLE_DELAY,
};
pub use protocol::{ClientMessage, ProtocolError, RelayMessage};
pub use resolver::{AddressResolver, NoTunnelResolver, ResolutionError, ResolvedAddress};
