//! Tunnel address resolution seam

use async_trait::async_trait;
use thiserror::Error;

/// A directly connectable host/port returned by the resolution service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedAddress {
    pub address: String,
    pub port: u16,
}

impl ResolvedAddress {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
        }
    }

    /// Websocket URL for the resolved host/port, normalized by `url`
    pub fn websocket_url(&self) -> Result<String, url::ParseError> {
        let url = url::Url::parse(&format!("ws://{}:{}", self.address, self.port))?;
        Ok(url.to_string())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct ResolutionError(pub String);

/// Resolves tunnel-style addresses to a local host/port
#[async_trait]
pub trait AddressResolver: Send + Sync {
    async fn resolve(&self, tunnel_address: &str) -> Result<ResolvedAddress, ResolutionError>;
}

/// Resolver for nodes running without a tunnel transport
#[derive(Debug, Default, Clone, Copy)]
pub struct NoTunnelResolver;

#[async_trait]
impl AddressResolver for NoTunnelResolver {
    async fn resolve(&self, tunnel_address: &str) -> Result<ResolvedAddress, ResolutionError> {
        Err(ResolutionError(format!(
            "no tunnel transport available for {}",
            tunnel_address
        )))
    }
}
