//! WebSocket transport
//!
//! The connection manager only talks to these traits so the reconnect logic
//! can be driven by scripted sessions in tests.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::trace;
use url::Url;

use crate::errors::{BridgeError, TransportError};

/// A single inbound message from the printer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Text(String),
    Binary(Vec<u8>),
    /// Control frames; only refresh liveness
    Control,
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &Url) -> Result<Box<dyn Session>, TransportError>;
}

#[async_trait]
pub trait Session: Send {
    async fn send(&mut self, text: String) -> Result<(), TransportError>;

    /// Next message; `None` once the socket is closed. Must be cancel safe.
    async fn recv(&mut self) -> Option<Result<Inbound, TransportError>>;

    async fn close(&mut self);
}

/// Printer endpoint for a host and port.
pub fn endpoint(host: &str, port: u16) -> Result<Url, BridgeError> {
    let raw = if host.contains(':') && !host.starts_with('[') {
        format!("ws://[{}]:{}", host, port)
    } else {
        format!("ws://{}:{}", host, port)
    };
    Url::parse(&raw).map_err(|e| BridgeError::ConfigError(format!("Invalid printer host {}: {}", host, e)))
}

/// Plain `ws://` connector backed by tokio-tungstenite
#[derive(Debug, Default, Clone)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &Url) -> Result<Box<dyn Session>, TransportError> {
        let (stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        Ok(Box::new(WsSession { stream }))
    }
}

pub struct WsSession {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Session for WsSession {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.stream
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<Inbound, TransportError>> {
        loop {
            let msg = match self.stream.next().await? {
                Ok(msg) => msg,
                Err(e) => return Some(Err(TransportError::Receive(e.to_string()))),
            };
            match msg {
                Message::Text(text) => return Some(Ok(Inbound::Text(text.to_string()))),
                Message::Binary(bytes) => return Some(Ok(Inbound::Binary(bytes.to_vec()))),
                Message::Ping(_) | Message::Pong(_) => return Some(Ok(Inbound::Control)),
                Message::Close(frame) => {
                    trace!("Printer closed socket: {:?}", frame);
                    return None;
                }
                Message::Frame(_) => continue,
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.stream.close(None).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint() {
        assert_eq!(endpoint("192.168.1.50", 9999).unwrap().as_str(), "ws://192.168.1.50:9999/");
        assert_eq!(endpoint("k2.local", 9999).unwrap().host_str(), Some("k2.local"));
        assert_eq!(endpoint("fe80::1", 9999).unwrap().port(), Some(9999));
        assert!(endpoint("bad host", 9999).is_err());
    }
}
