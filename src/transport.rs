//! Socket transports carrying STOMP text.
//!
//! DESIGN
//! ======
//! A [`Transport`] moves whole text messages; it knows nothing about STOMP.
//! [`Connector`] opens one per URL and is the seam tests replace with an
//! in-memory broker. Two real framings exist: raw WebSocket text frames, and
//! SockJS's websocket transport, which wraps every payload in a JSON array.
//!
//! `recv` must be cancellation-safe: the connection loop polls it inside
//! `tokio::select!` next to its outbound queue and heart-beat timer.

use std::collections::VecDeque;

use async_trait::async_trait;
use frames::sockjs::{self, SockJsError, SockJsFrame};
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::debug;
use uuid::Uuid;

use crate::alert::ErrorCode;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("invalid socket url: {0}")]
    InvalidUrl(String),
    #[error("websocket error: {0}")]
    WebSocket(#[from] Box<tungstenite::Error>),
    #[error("sockjs framing error: {0}")]
    SockJs(#[from] SockJsError),
    #[error("socket closed by server ({code}): {reason}")]
    Closed { code: u16, reason: String },
}

impl ErrorCode for TransportError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidUrl(_) => "E_INVALID_URL",
            Self::WebSocket(_) => "E_TRANSPORT_CONNECT",
            Self::SockJs(_) => "E_TRANSPORT_FRAMING",
            Self::Closed { .. } => "E_TRANSPORT_CLOSED",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::WebSocket(_) | Self::Closed { .. })
    }
}

/// Which framing to use on the socket.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TransportKind {
    #[default]
    SockJs,
    WebSocket,
}

impl std::str::FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sockjs" => Ok(Self::SockJs),
            "websocket" | "ws" | "raw" => Ok(Self::WebSocket),
            other => Err(format!("unknown transport: {other}")),
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::SockJs => "sockjs",
            Self::WebSocket => "websocket",
        })
    }
}

/// A bidirectional text-message pipe.
#[async_trait]
pub trait Transport: Send {
    async fn send(&mut self, text: String) -> Result<(), TransportError>;

    /// Next inbound message. `None` once the peer has closed.
    async fn recv(&mut self) -> Option<Result<String, TransportError>>;

    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Opens transports.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, url: &str) -> Result<Box<dyn Transport>, TransportError>;
}

// =============================================================================
// URLS
// =============================================================================

/// Convert an `http(s)` URL to its `ws(s)` form. `ws(s)` URLs pass through.
///
/// # Errors
///
/// Returns [`TransportError::InvalidUrl`] for any other scheme.
pub fn ws_url(url: &str) -> Result<String, TransportError> {
    if let Some(rest) = url.strip_prefix("http://") {
        return Ok(format!("ws://{rest}"));
    }
    if let Some(rest) = url.strip_prefix("https://") {
        return Ok(format!("wss://{rest}"));
    }
    if url.starts_with("ws://") || url.starts_with("wss://") {
        return Ok(url.to_owned());
    }

    Err(TransportError::InvalidUrl(url.to_owned()))
}

/// SockJS websocket-transport URL under `base`.
#[must_use]
pub fn sockjs_url(base: &str, server_id: u16, session_id: &str) -> String {
    format!("{}/{server_id:03}/{session_id}/websocket", base.trim_end_matches('/'))
}

// =============================================================================
// WEBSOCKET
// =============================================================================

/// Opens real sockets with `tokio-tungstenite`.
#[derive(Clone, Copy, Debug, Default)]
pub struct WsConnector {
    kind: TransportKind,
}

impl WsConnector {
    #[must_use]
    pub fn new(kind: TransportKind) -> Self {
        Self { kind }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn open(&self, url: &str) -> Result<Box<dyn Transport>, TransportError> {
        let base = ws_url(url)?;
        let target = match self.kind {
            TransportKind::WebSocket => base,
            TransportKind::SockJs => {
                let server_id = rand::rng().random_range(0..1000);
                sockjs_url(&base, server_id, &Uuid::new_v4().simple().to_string())
            }
        };

        debug!(url = %target, kind = %self.kind, "transport: opening socket");
        let (stream, _) = connect_async(target.as_str()).await.map_err(Box::new)?;
        let raw = WsTransport { stream };

        Ok(match self.kind {
            TransportKind::WebSocket => Box::new(raw),
            TransportKind::SockJs => Box::new(SockJsTransport::new(Box::new(raw))),
        })
    }
}

pub struct WsTransport {
    stream: WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.stream.send(Message::Text(text.into())).await.map_err(Box::new)?;
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<String, TransportError>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text.as_str().to_owned())),
                Ok(Message::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => return Some(Ok(text)),
                    Err(_) => debug!("transport: dropping non-utf8 binary message"),
                },
                Ok(Message::Close(_)) => return None,
                Ok(_) => {}
                Err(e) => return Some(Err(Box::new(e).into())),
            }
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.stream.close(None).await.map_err(Box::new)?;
        Ok(())
    }
}

// =============================================================================
// SOCKJS
// =============================================================================

/// SockJS framing over any inner transport.
pub struct SockJsTransport {
    inner: Box<dyn Transport>,
    pending: VecDeque<String>,
}

impl SockJsTransport {
    #[must_use]
    pub fn new(inner: Box<dyn Transport>) -> Self {
        Self { inner, pending: VecDeque::new() }
    }
}

#[async_trait]
impl Transport for SockJsTransport {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        let wrapped = sockjs::encode_messages(&[text])?;
        self.inner.send(wrapped).await
    }

    async fn recv(&mut self) -> Option<Result<String, TransportError>> {
        loop {
            if let Some(message) = self.pending.pop_front() {
                return Some(Ok(message));
            }
            let text = match self.inner.recv().await? {
                Ok(text) => text,
                Err(e) => return Some(Err(e)),
            };
            match sockjs::decode(&text) {
                Ok(SockJsFrame::Open | SockJsFrame::Heartbeat) => {}
                Ok(SockJsFrame::Messages(messages)) => self.pending.extend(messages),
                Ok(SockJsFrame::Close { code, reason }) => {
                    return Some(Err(TransportError::Closed { code, reason }));
                }
                Err(e) => return Some(Err(e.into())),
            }
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.inner.close().await
    }
}

#[cfg(test)]
#[path = "transport_test.rs"]
mod tests;
