//! Connection seams: a `Connector` opens `Transport`s carrying text frames.

use futures::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("send failed: {0}")]
    Send(String),
    #[error("receive failed: {0}")]
    Receive(String),
}

/// Opens duplex text connections to an endpoint.
#[async_trait::async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, endpoint: &str) -> Result<Box<dyn Transport>, TransportError>;
}

/// One open connection. `recv` must be cancel safe: the client races it
/// against the heartbeat timer and the stop signal.
#[async_trait::async_trait]
pub trait Transport: Send {
    async fn send(&mut self, text: &str) -> Result<(), TransportError>;

    /// Next inbound text frame. `None` means the peer closed the connection.
    async fn recv(&mut self) -> Option<Result<String, TransportError>>;

    async fn close(&mut self);
}

/// WebSocket connector backed by `tokio-tungstenite`.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

#[async_trait::async_trait]
impl Connector for WsConnector {
    async fn connect(&self, endpoint: &str) -> Result<Box<dyn Transport>, TransportError> {
        if endpoint.starts_with("wss://") {
            install_crypto_provider();
        }
        let (ws, resp) = tokio_tungstenite::connect_async(endpoint)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        debug!(endpoint = %endpoint, status = %resp.status(), "stream: websocket handshake ok");
        Ok(Box::new(WsTransport { ws }))
    }
}

/// Process-wide rustls provider; a no-op when one is already installed.
fn install_crypto_provider() {
    if rustls::crypto::ring::default_provider().install_default().is_ok() {
        debug!("stream: installed rustls ring crypto provider");
    }
}

struct WsTransport {
    ws: tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
}

#[async_trait::async_trait]
impl Transport for WsTransport {
    async fn send(&mut self, text: &str) -> Result<(), TransportError> {
        self.ws
            .send(Message::Text(text.to_owned().into()))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<String, TransportError>> {
        loop {
            match self.ws.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text.as_str().to_owned())),
                // Invalid UTF-8 surfaces as a malformed message, not a broken socket.
                Ok(Message::Binary(data)) => return Some(Ok(String::from_utf8_lossy(&data).into_owned())),
                Ok(Message::Close(_)) => return None,
                // Protocol-level ping/pong is answered by tungstenite itself.
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => continue,
                Err(e) => return Some(Err(TransportError::Receive(e.to_string()))),
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.ws.close(None).await {
            debug!(error = %e, "stream: close handshake failed");
        }
    }
}
