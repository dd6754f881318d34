//! WebSocket session channel built on `tokio-tungstenite`.
//!
//! [`WebSocketTransport`] carries the arbiter's JSON messages as text frames
//! over `ws://` or `wss://`. [`WebSocketConnector`] dials a fresh transport for
//! each `open()` of the client.
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> Result<(), faceshot_client::FaceshotError> {
//! use faceshot_client::{Transport, WebSocketTransport};
//!
//! let mut transport = WebSocketTransport::connect("ws://localhost:8765").await?;
//! transport.send(r#"{"type":"who"}"#.to_string()).await?;
//!
//! if let Some(Ok(msg)) = transport.recv().await {
//!     println!("arbiter said: {msg}");
//! }
//!
//! transport.close().await?;
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::protocol::Message;

use crate::error::FaceshotError;
use crate::transport::{Connector, Transport};

/// Default time allowed for the WebSocket handshake.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Type alias for the underlying WebSocket stream.
pub type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// A [`Transport`] backed by a WebSocket connection.
///
/// # Cancel Safety
///
/// [`recv`](Transport::recv) only awaits the next frame of the underlying
/// stream, so dropping its future never loses a message.
#[derive(Debug)]
pub struct WebSocketTransport {
    stream: WsStream,
    closed: bool,
}

impl WebSocketTransport {
    /// Open a WebSocket connection to `url`.
    ///
    /// # Errors
    ///
    /// Returns [`FaceshotError::Io`] if the URL is invalid or the handshake
    /// fails. An underlying I/O error keeps its [`std::io::ErrorKind`].
    pub async fn connect(url: &str) -> Result<Self, FaceshotError> {
        tracing::debug!(url = %url, "dialing arbiter");

        let (stream, _response) = tokio_tungstenite::connect_async(url).await.map_err(|e| {
            let kind = match &e {
                tokio_tungstenite::tungstenite::Error::Io(io) => io.kind(),
                _ => std::io::ErrorKind::Other,
            };
            FaceshotError::Io(std::io::Error::new(kind, e))
        })?;

        tracing::info!(url = %url, "session channel open");

        Ok(Self::from_stream(stream))
    }

    /// Open a WebSocket connection, failing with [`FaceshotError::Timeout`]
    /// if the handshake does not finish within `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`FaceshotError::Timeout`] or any error from [`connect`](Self::connect).
    pub async fn connect_with_timeout(
        url: &str,
        timeout: Duration,
    ) -> Result<Self, FaceshotError> {
        tokio::time::timeout(timeout, Self::connect(url))
            .await
            .map_err(|_| FaceshotError::Timeout)?
    }

    /// Wrap an already-established stream (custom TLS, proxies, headers).
    pub fn from_stream(stream: WsStream) -> Self {
        Self {
            stream,
            closed: false,
        }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send(&mut self, message: String) -> Result<(), FaceshotError> {
        if self.closed {
            return Err(FaceshotError::TransportClosed);
        }
        self.stream
            .send(Message::Text(message.into()))
            .await
            .map_err(|e| FaceshotError::TransportSend(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<String, FaceshotError>> {
        while let Some(frame) = self.stream.next().await {
            match frame {
                Ok(Message::Text(text)) => return Some(Ok(text.to_string())),
                Ok(Message::Close(close)) => {
                    tracing::debug!(?close, "arbiter sent close frame");
                    return None;
                }
                // tungstenite answers pings on its own.
                Ok(Message::Ping(_) | Message::Pong(_)) => {}
                Ok(Message::Binary(bytes)) => {
                    tracing::warn!(len = bytes.len(), "ignoring binary frame from arbiter");
                }
                Ok(Message::Frame(_)) => {}
                Err(e) => return Some(Err(FaceshotError::TransportReceive(e.to_string()))),
            }
        }
        None
    }

    async fn close(&mut self) -> Result<(), FaceshotError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.stream
            .close(None)
            .await
            .map_err(|e| FaceshotError::TransportSend(e.to_string()))
    }
}

/// [`Connector`] that dials a [`WebSocketTransport`] per connection.
#[derive(Debug, Clone, Copy)]
pub struct WebSocketConnector {
    connect_timeout: Duration,
}

impl WebSocketConnector {
    /// Connector with the default 10 second handshake timeout.
    pub fn new() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Set the handshake timeout.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

impl Default for WebSocketConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn Transport>, FaceshotError> {
        let transport = WebSocketTransport::connect_with_timeout(url, self.connect_timeout).await?;
        Ok(Box::new(transport))
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Accept one WebSocket connection on a local port and hand it to `handler`.
    async fn start_mock_arbiter<F, Fut>(handler: F) -> String
    where
        F: FnOnce(tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>) -> Fut
            + Send
            + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            handler(ws).await;
        });

        format!("ws://{addr}")
    }

    #[test]
    fn websocket_transport_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<WebSocketTransport>();
    }

    #[tokio::test]
    async fn connect_fails_with_invalid_url() {
        let err = WebSocketTransport::connect("not-a-url").await.unwrap_err();
        assert!(matches!(err, FaceshotError::Io(_)));
    }

    #[tokio::test]
    async fn connector_times_out_on_unroutable_host() {
        let connector =
            WebSocketConnector::new().with_connect_timeout(Duration::from_millis(50));
        let err = connector.connect("ws://192.0.2.1:1").await.err().unwrap();
        assert!(matches!(err, FaceshotError::Timeout));
    }

    #[tokio::test]
    async fn who_probe_reaches_arbiter_and_reply_is_received() {
        let url = start_mock_arbiter(|mut ws| async move {
            if let Some(Ok(Message::Text(text))) = ws.next().await {
                assert_eq!(text.as_str(), r#"{"type":"who"}"#);
                ws.send(Message::Text(r#"{"type":"players","list":[]}"#.into()))
                    .await
                    .unwrap();
            }
            ws.close(None).await.unwrap();
        })
        .await;

        let mut transport = WebSocketConnector::new().connect(&url).await.unwrap();
        transport.send(r#"{"type":"who"}"#.to_string()).await.unwrap();

        let reply = transport.recv().await.unwrap().unwrap();
        assert_eq!(reply, r#"{"type":"players","list":[]}"#);
        assert!(transport.recv().await.is_none());
    }

    #[tokio::test]
    async fn binary_frames_are_skipped() {
        let url = start_mock_arbiter(|mut ws| async move {
            ws.send(Message::Binary(vec![1, 2, 3].into())).await.unwrap();
            ws.send(Message::Text(r#"{"type":"miss","score":0.2}"#.into()))
                .await
                .unwrap();
            ws.close(None).await.unwrap();
        })
        .await;

        let mut transport = WebSocketTransport::connect(&url).await.unwrap();
        let msg = transport.recv().await.unwrap().unwrap();
        assert_eq!(msg, r#"{"type":"miss","score":0.2}"#);
    }

    #[tokio::test]
    async fn send_after_close_is_rejected_and_close_is_idempotent() {
        let url =
            start_mock_arbiter(|mut ws| async move { while let Some(Ok(_)) = ws.next().await {} })
                .await;

        let mut transport = WebSocketTransport::connect(&url).await.unwrap();
        transport.close().await.unwrap();
        transport.close().await.unwrap();

        let err = transport.send("late".to_string()).await.unwrap_err();
        assert!(matches!(err, FaceshotError::TransportClosed));
    }
}
