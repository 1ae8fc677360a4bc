//! Relay connections as a pair of message queues
//!
//! A [`Connection`] hides the socket behind an ordered outbound queue and an
//! inbound queue. Dropping the outbound sender closes the socket; the inbound
//! queue ends when the remote side goes away.

use super::protocol::{ClientMessage, RelayMessage};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectError {
    #[error("Connection timeout after {0:?}")]
    Timeout(Duration),
    #[error("WebSocket error: {0}")]
    WebSocket(String),
}

/// An established relay connection
#[derive(Debug)]
pub struct Connection {
    /// Frames to the relay, written in send order
    pub outbound: mpsc::UnboundedSender<ClientMessage>,
    /// Frames from the relay; `None` once the connection is gone
    pub inbound: mpsc::UnboundedReceiver<RelayMessage>,
}

/// Dials relays
#[async_trait]
pub trait RelayConnector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Connection, ConnectError>;
}

/// Connector over websockets
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    connect_timeout: Duration,
}

impl Default for WebSocketConnector {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl WebSocketConnector {
    pub fn with_timeout(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl RelayConnector for WebSocketConnector {
    async fn connect(&self, url: &str) -> Result<Connection, ConnectError> {
        let (stream, _) = timeout(self.connect_timeout, connect_async(url))
            .await
            .map_err(|_| ConnectError::Timeout(self.connect_timeout))?
            .map_err(|e| ConnectError::WebSocket(e.to_string()))?;

        info!(relay = %url, "Connected to relay");

        let (mut sink, mut source) = stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<ClientMessage>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<RelayMessage>();

        let relay = url.to_string();
        tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                let text = match message.to_json() {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(relay = %relay, "Dropping unserializable {} frame: {}", message.message_type(), e);
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::Text(text)).await {
                    warn!(relay = %relay, "WebSocket write failed: {}", e);
                    break;
                }
            }
            let _ = sink.close().await;
            debug!(relay = %relay, "Writer finished");
        });

        let relay = url.to_string();
        tokio::spawn(async move {
            while let Some(frame) = source.next().await {
                match frame {
                    Ok(Message::Text(text)) => match RelayMessage::from_json(&text) {
                        Ok(message) => {
                            if inbound_tx.send(message).is_err() {
                                break;
                            }
                        }
                        Err(e) => debug!(relay = %relay, "Ignoring relay frame: {}", e),
                    },
                    Ok(Message::Close(_)) => {
                        info!(relay = %relay, "Relay closed connection");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(relay = %relay, "WebSocket error: {}", e);
                        break;
                    }
                }
            }
        });

        Ok(Connection {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}
