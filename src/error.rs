//! Error types for the Faceshot client.

use thiserror::Error;

use crate::client::Intent;

/// Errors that can occur when using the Faceshot client.
#[derive(Debug, Error)]
pub enum FaceshotError {
    /// Failed to send a message through the transport.
    #[error("transport send error: {0}")]
    TransportSend(String),

    /// Failed to receive a message from the transport.
    #[error("transport receive error: {0}")]
    TransportReceive(String),

    /// The transport connection was closed.
    #[error("transport connection closed")]
    TransportClosed,

    /// Failed to serialize or deserialize a protocol message.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The session loop is gone or no connection is open.
    #[error("not connected to arbiter")]
    NotConnected,

    /// `join` was called with an empty (or all-whitespace) name.
    #[error("a player name is required to join")]
    EmptyIdentity,

    /// `shoot` was called before the arbiter confirmed registration.
    #[error("join the game before firing")]
    NotRegistered,

    /// `join` was called after the arbiter already confirmed registration.
    #[error("already registered for this session")]
    AlreadyRegistered,

    /// Another capture for the same intent has not resolved yet.
    #[error("a {0} attempt is already in progress")]
    ActionInProgress(Intent),

    /// The capture loop exhausted its attempts without detecting a face.
    #[error("no face detected after {attempts} attempt(s)")]
    FaceNotFound {
        /// Number of extractor invocations performed.
        attempts: u32,
    },

    /// The signature extractor failed on a single frame.
    #[error("signature extractor error: {0}")]
    Extractor(String),

    /// A roster reconciliation request failed.
    #[error("roster fetch error: {0}")]
    RosterFetch(String),

    /// An operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A specialized [`Result`] type for Faceshot client operations.
pub type Result<T> = std::result::Result<T, FaceshotError>;
