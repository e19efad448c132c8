//! WebSocket transport abstraction for the channel driver.
//!
//! The driver never touches tokio-tungstenite directly: it asks a `Connector`
//! for a fresh `Transport` on every (re)connect attempt. `WebSocketConnector`
//! is the production backend, `MemoryConnector` hands the broker side of each
//! connection to the caller so a test can play the server.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::debug;

/// A WebSocket message as seen by the channel driver
#[derive(Debug, Clone, PartialEq)]
pub enum WsMessage {
    Text(String),
    Binary(Vec<u8>),
    Close,
}

/// Transport errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Connection closed")]
    Closed,
}

/// Factory for transport connections
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Box<dyn Transport>, TransportError>;
}

/// One live WebSocket connection
#[async_trait]
pub trait Transport: Send {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError>;

    /// Next message, or `None` once the connection is gone
    async fn recv(&mut self) -> Option<Result<WsMessage, TransportError>>;

    async fn close(&mut self) -> Result<(), TransportError>;
}

// ============================================================================
// TOKIO-TUNGSTENITE BACKEND
// ============================================================================

/// Connects with tokio-tungstenite (`ws://` and `wss://`)
#[derive(Debug, Default, Clone)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn Transport>, TransportError> {
        let (stream, response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        debug!("WebSocket handshake with {} -> {}", url, response.status());
        Ok(Box::new(WebSocketTransport { stream }))
    }
}

struct WebSocketTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.stream
            .send(Message::Text(text))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<WsMessage, TransportError>> {
        loop {
            let msg = match self.stream.next().await? {
                Ok(msg) => msg,
                Err(e) => return Some(Err(TransportError::ConnectionFailed(e.to_string()))),
            };
            match msg {
                Message::Text(text) => return Some(Ok(WsMessage::Text(text))),
                Message::Binary(data) => return Some(Ok(WsMessage::Binary(data))),
                Message::Close(_) => return Some(Ok(WsMessage::Close)),
                // Pong is handled by tungstenite
                _ => continue,
            }
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.stream
            .close(None)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }
}

// ============================================================================
// IN-MEMORY BACKEND
// ============================================================================

/// Broker side of one in-memory connection
pub struct MemoryPeer {
    /// Text frames written by the client
    pub from_client: mpsc::UnboundedReceiver<String>,
    /// Push messages to the client; drop it to simulate a socket close
    pub to_client: mpsc::UnboundedSender<WsMessage>,
}

/// In-memory connector: every successful `connect` yields a `MemoryPeer`
/// on the accept queue.
#[derive(Clone)]
pub struct MemoryConnector {
    accept_tx: mpsc::UnboundedSender<MemoryPeer>,
    refuse: Arc<Mutex<u32>>,
}

impl MemoryConnector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MemoryPeer>) {
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        (
            Self {
                accept_tx,
                refuse: Arc::new(Mutex::new(0)),
            },
            accept_rx,
        )
    }

    /// Make the next `count` connection attempts fail
    pub fn refuse_next(&self, count: u32) {
        *self.refuse.lock() = count;
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn Transport>, TransportError> {
        {
            let mut refuse = self.refuse.lock();
            if *refuse > 0 {
                *refuse -= 1;
                return Err(TransportError::ConnectionFailed(format!("refused: {}", url)));
            }
        }

        let (client_tx, from_client) = mpsc::unbounded_channel();
        let (to_client, client_rx) = mpsc::unbounded_channel();
        self.accept_tx
            .send(MemoryPeer {
                from_client,
                to_client,
            })
            .map_err(|_| TransportError::ConnectionFailed("acceptor dropped".to_string()))?;

        Ok(Box::new(MemoryTransport {
            tx: client_tx,
            rx: client_rx,
        }))
    }
}

struct MemoryTransport {
    tx: mpsc::UnboundedSender<String>,
    rx: mpsc::UnboundedReceiver<WsMessage>,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.tx.send(text).map_err(|_| TransportError::Closed)
    }

    async fn recv(&mut self) -> Option<Result<WsMessage, TransportError>> {
        self.rx.recv().await.map(Ok)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.rx.close();
        Ok(())
    }
}
