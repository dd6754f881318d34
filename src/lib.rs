//! # Faceshot Client
//!
//! Async client for a face-similarity multiplayer shooting game. A player
//! registers with a captured facial signature, then fires by capturing a
//! fresh one. A remote arbiter matches each shot against every registered
//! face and deducts health from whoever it resembles most.
//!
//! This crate implements the client side of that exchange:
//!
//! - **Capture loop**: bounded-retry signature capture over any [`SignatureExtractor`]
//! - **Session channel**: JSON messages over any [`Transport`]; WebSocket built in
//! - **Protocol state machine**: [`Session`] enforces "register before firing"
//!   and applies arbiter events in arrival order
//! - **Roster reconciliation**: periodic HTTP pulls of the full roster as a
//!   consistency backstop
//!
//! The presentation layer consumes [`ClientEvent`]s from a channel and reads
//! [`SessionSnapshot`]s from the [`FaceshotClient`] handle.

pub mod capture;
pub mod client;
pub mod error;
pub mod event;
pub mod protocol;
pub mod reconcile;
pub mod roster;
pub mod session;
pub mod transport;
pub mod transports;

// Re-export primary types for ergonomic imports.
pub use capture::{CapturePolicy, Detection, FaceRegion, SignatureExtractor, Sleeper};
pub use client::{Collaborators, FaceshotClient, FaceshotConfig, Intent};
pub use error::FaceshotError;
pub use event::{ClientEvent, RosterSource};
pub use protocol::{ClientMessage, RosterEntry, ServerMessage, Signature};
pub use reconcile::RosterFetcher;
pub use roster::Roster;
pub use session::{Session, SessionSnapshot, SessionState};
pub use transport::{Connector, Transport};

#[cfg(feature = "roster-http")]
pub use reconcile::HttpRosterFetcher;
#[cfg(feature = "transport-websocket")]
pub use transports::{WebSocketConnector, WebSocketTransport};
