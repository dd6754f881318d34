//! Transport abstraction for the arbiter's session channel.
//!
//! The [`Transport`] trait defines a bidirectional text message channel between
//! the client and the arbiter. Every message is one JSON document, so each
//! transport handles framing internally (WebSocket text frames for the
//! built-in implementation).
//!
//! The [`Connector`] trait opens a fresh [`Transport`] on demand. The session
//! loop calls it on every `open()`, which lets a client reconnect after the
//! channel collapses without rebuilding the handle.
//!
//! # Implementing a Custom Transport
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use faceshot_client::error::FaceshotError;
//! use faceshot_client::transport::{Connector, Transport};
//!
//! struct MyTransport { /* ... */ }
//!
//! #[async_trait]
//! impl Transport for MyTransport {
//!     async fn send(&mut self, message: String) -> Result<(), FaceshotError> {
//!         todo!()
//!     }
//!
//!     async fn recv(&mut self) -> Option<Result<String, FaceshotError>> {
//!         // Return None when the connection is closed cleanly
//!         todo!()
//!     }
//!
//!     async fn close(&mut self) -> Result<(), FaceshotError> {
//!         todo!()
//!     }
//! }
//!
//! struct MyConnector;
//!
//! #[async_trait]
//! impl Connector for MyConnector {
//!     async fn connect(&self, url: &str) -> Result<Box<dyn Transport>, FaceshotError> {
//!         Ok(Box::new(MyTransport { /* dial `url` */ }))
//!     }
//! }
//! ```

use async_trait::async_trait;

use crate::error::FaceshotError;

/// A bidirectional text message transport to the arbiter.
///
/// Each call to [`send`](Transport::send) transmits one complete JSON message.
/// Each call to [`recv`](Transport::recv) returns one complete JSON message.
///
/// # Object Safety
///
/// This trait is object-safe; the session loop holds the live connection as
/// `Box<dyn Transport>`.
///
/// # Cancel Safety
///
/// The [`recv`](Transport::recv) method **MUST** be cancel-safe because it is used
/// inside `tokio::select!`. If `recv` is cancelled before completion, calling it
/// again must not lose data.
#[async_trait]
pub trait Transport: Send + 'static {
    /// Send a JSON text message to the arbiter.
    ///
    /// # Errors
    ///
    /// Returns [`FaceshotError::TransportSend`] if the message could not be sent,
    /// or [`FaceshotError::TransportClosed`] after [`close`](Transport::close).
    async fn send(&mut self, message: String) -> Result<(), FaceshotError>;

    /// Receive the next JSON text message from the arbiter.
    ///
    /// Returns:
    /// - `Some(Ok(text))`: a complete message was received
    /// - `Some(Err(e))`: a transport error occurred
    /// - `None`: the connection was closed cleanly
    async fn recv(&mut self) -> Option<Result<String, FaceshotError>>;

    /// Close the transport connection gracefully.
    ///
    /// # Errors
    ///
    /// Returns an error if the close handshake fails. Implementations should
    /// still release resources in that case.
    async fn close(&mut self) -> Result<(), FaceshotError>;
}

/// Opens connections to the arbiter.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Establish a new connection to `url`.
    ///
    /// # Errors
    ///
    /// Returns [`FaceshotError::Io`] or [`FaceshotError::Timeout`] when the
    /// connection cannot be established.
    async fn connect(&self, url: &str) -> Result<Box<dyn Transport>, FaceshotError>;
}
