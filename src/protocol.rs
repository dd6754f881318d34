//! Wire protocol types for the arbiter's session channel.
//!
//! Every message is a flat JSON object tagged by a lowercase `type` field,
//! e.g. `{"type":"shoot","embedding":[0.12,-0.03,...]}`. The roster side
//! channel returns a bare JSON array of [`RosterEntry`] values.

use serde::{Deserialize, Serialize};

// ── Signature ───────────────────────────────────────────────────────

/// A facial signature: the descriptor vector produced by the extractor.
///
/// Serialized transparently as a JSON array of numbers. The client never
/// compares signatures itself; similarity is scored by the arbiter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Signature(Vec<f32>);

impl Signature {
    /// Wrap a descriptor vector.
    pub fn new(values: Vec<f32>) -> Self {
        Self(values)
    }

    /// Number of components in the descriptor.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if the descriptor has no components.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Borrow the descriptor components.
    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    /// Returns `true` if the signature is non-empty and every component is
    /// finite. NaN and infinities cannot be represented in JSON.
    pub fn is_well_formed(&self) -> bool {
        !self.0.is_empty() && self.0.iter().all(|v| v.is_finite())
    }
}

impl From<Vec<f32>> for Signature {
    fn from(values: Vec<f32>) -> Self {
        Self(values)
    }
}

// ── Roster ──────────────────────────────────────────────────────────

/// One player in the arbiter's roster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterEntry {
    pub name: String,
    pub hp: i64,
}

impl RosterEntry {
    pub fn new(name: impl Into<String>, hp: i64) -> Self {
        Self {
            name: name.into(),
            hp,
        }
    }
}

// ── Messages ────────────────────────────────────────────────────────

/// Message types sent from client to arbiter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    /// Identity probe, sent immediately after every connect so the arbiter
    /// can resynchronize a client that reconnected mid-session.
    Who,
    /// Request registration under `name` with a freshly captured signature.
    Register { name: String, embedding: Signature },
    /// Submit a shot; the arbiter matches `embedding` against registered players.
    Shoot { embedding: Signature },
}

/// Message types sent from arbiter to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    /// Registration accepted.
    Registered { name: String, hp: i64 },
    /// Full roster snapshot.
    Players { list: Vec<RosterEntry> },
    /// A shot from `from` struck `target`, leaving them at `hp`.
    Hit {
        from: String,
        target: String,
        hp: i64,
        score: f64,
    },
    /// A shot struck no one.
    Miss { score: f64 },
    /// Human-readable rejection or fault.
    Error { msg: String },
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

    #[test]
    fn who_serializes_to_bare_tag() {
        let json = serde_json::to_string(&ClientMessage::Who).unwrap();
        assert_eq!(json, r#"{"type":"who"}"#);
    }

    #[test]
    fn signature_is_a_plain_number_array() {
        let msg = ClientMessage::Shoot {
            embedding: Signature::new(vec![0.5, -0.25]),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"type":"shoot","embedding":[0.5,-0.25]}"#);
    }

    #[test]
    fn well_formed_rejects_empty_and_non_finite() {
        assert!(Signature::new(vec![0.1, 0.2]).is_well_formed());
        assert!(!Signature::new(vec![]).is_well_formed());
        assert!(!Signature::new(vec![0.1, f32::NAN]).is_well_formed());
        assert!(!Signature::new(vec![f32::INFINITY]).is_well_formed());
    }

    #[test]
    fn unknown_server_type_is_rejected() {
        let result = serde_json::from_str::<ServerMessage>(r#"{"type":"teleport"}"#);
        assert!(result.is_err());
    }
}
