//! Events delivered to the presentation layer.

use crate::protocol::RosterEntry;

/// Where a roster snapshot came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RosterSource {
    /// Pushed by the arbiter over the session channel (`players`).
    Push,
    /// Pulled by periodic reconciliation over the side channel.
    Pull,
}

/// High-level events emitted by the session loop, in the order the
/// underlying channel events and roster pulls were applied.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// The session channel opened and the identity probe was sent.
    Connected,
    /// The arbiter confirmed registration. Emitted once per connection.
    Registered { name: String, hp: i64 },
    /// The roster projection was replaced by a full snapshot.
    RosterReplaced {
        players: Vec<RosterEntry>,
        source: RosterSource,
    },
    /// A shot struck `target`.
    Hit {
        from: String,
        target: String,
        hp: i64,
        score: f64,
    },
    /// The local player was the target of a hit. Follows the matching
    /// [`Hit`](ClientEvent::Hit).
    Distress { from: String, hp: i64, score: f64 },
    /// A shot struck no one.
    Miss { score: f64 },
    /// The arbiter rejected something; `message` is shown verbatim.
    ServerError { message: String },
    /// The session channel closed. Registration is void; call `join` again.
    Disconnected {
        /// `None` for a clean close by the arbiter.
        reason: Option<String>,
    },
}
