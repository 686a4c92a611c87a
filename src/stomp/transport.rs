// Transport layer: a persistent bidirectional text connection
// The STOMP client only sees these traits; `WsConnector` is the production
// implementation over a (secure) WebSocket.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

/// Errors raised by a transport
#[derive(Debug, Error)]
pub enum TransportError {
    /// Bad URL or header value, detected before any I/O
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Network, TLS, DNS or handshake failure
    #[error("Failed to open transport: {0}")]
    Open(String),

    /// The write side rejected a frame
    #[error("Failed to write to transport: {0}")]
    Write(String),

    #[error("Transport closed")]
    Closed,
}

/// What the read side of a transport produced
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Text(String),
    Closed { code: u16, reason: String },
    Failed(String),
}

/// Write half of an open transport
#[async_trait]
pub trait FrameSink: Send {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError>;

    /// Close the transport. Must be safe to call more than once.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Read half of an open transport. `None` means the stream ended.
#[async_trait]
pub trait FrameSource: Send {
    async fn next_event(&mut self) -> Option<TransportEvent>;
}

/// Opens transports. Called once per connection attempt.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(
        &self,
        url: &str,
        token: &str,
    ) -> Result<(Box<dyn FrameSink>, Box<dyn FrameSource>), TransportError>;
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket connector built on tokio-tungstenite
#[derive(Debug, Default, Clone)]
pub struct WsConnector;

impl WsConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn open(
        &self,
        url: &str,
        token: &str,
    ) -> Result<(Box<dyn FrameSink>, Box<dyn FrameSource>), TransportError> {
        let mut request = url
            .into_client_request()
            .map_err(|e| TransportError::InvalidRequest(e.to_string()))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|e| TransportError::InvalidRequest(e.to_string()))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        info!("Opening WebSocket to {}", url);
        let (stream, response) = connect_async(request)
            .await
            .map_err(|e| TransportError::Open(e.to_string()))?;
        debug!("WebSocket handshake completed with status {}", response.status());

        let (write, read) = stream.split();
        Ok((
            Box::new(WsSink { write, closed: false }),
            Box::new(WsSource { read }),
        ))
    }
}

struct WsSink {
    write: SplitSink<WsStream, WsMessage>,
    closed: bool,
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        self.write
            .send(WsMessage::Text(text.into()))
            .await
            .map_err(|e| TransportError::Write(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: "Normal closure".into(),
        };
        if let Err(e) = self.write.send(WsMessage::Close(Some(frame))).await {
            debug!("Close frame not sent: {}", e);
        }
        self.write
            .close()
            .await
            .map_err(|e| TransportError::Write(e.to_string()))
    }
}

struct WsSource {
    read: SplitStream<WsStream>,
}

#[async_trait]
impl FrameSource for WsSource {
    async fn next_event(&mut self) -> Option<TransportEvent> {
        loop {
            let message = match self.read.next().await? {
                Ok(message) => message,
                Err(e) => return Some(TransportEvent::Failed(e.to_string())),
            };
            match message {
                WsMessage::Text(text) => return Some(TransportEvent::Text(text.as_str().to_owned())),
                WsMessage::Close(frame) => {
                    let (code, reason) = match frame {
                        Some(frame) => (u16::from(frame.code), frame.reason.as_str().to_owned()),
                        None => (1005, String::new()),
                    };
                    return Some(TransportEvent::Closed { code, reason });
                }
                WsMessage::Binary(bytes) => {
                    // The broker only speaks text frames
                    warn!("Ignoring binary message of {} bytes", bytes.len());
                }
                // Pong is handled automatically by tungstenite
                _ => {}
            }
        }
    }
}
