//! Client protocol state machine.
//!
//! [`Session`] holds everything the client knows about one player's session:
//! the lifecycle state, the confirmed identity, and the roster projection. It
//! is synchronous and owned by the client's background loop, which feeds it
//! channel lifecycle changes, inbound [`ServerMessage`]s, roster pulls, and
//! outbound [`ClientMessage`]s in one total order.
//!
//! ```text
//! Disconnected ──connected()──▶ ConnectedUnregistered ──registered──▶ ConnectedRegistered
//!      ▲                                  │                                   │
//!      └──────────────────────────── teardown() ◀─────────────────────────────┘
//! ```

use std::fmt;

use tracing::{debug, info, warn};

use crate::error::{FaceshotError, Result};
use crate::event::{ClientEvent, RosterSource};
use crate::protocol::{ClientMessage, RosterEntry, ServerMessage};
use crate::roster::Roster;

/// Lifecycle state of the session channel and registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// No channel open.
    #[default]
    Disconnected,
    /// Channel open, registration not yet confirmed by the arbiter.
    ConnectedUnregistered,
    /// The arbiter confirmed registration; firing is allowed.
    ConnectedRegistered,
}

impl SessionState {
    pub fn is_connected(self) -> bool {
        !matches!(self, Self::Disconnected)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Disconnected => "disconnected",
            Self::ConnectedUnregistered => "connected (unregistered)",
            Self::ConnectedRegistered => "connected (registered)",
        })
    }
}

/// Immutable copy of the session published to client handles.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub identity: Option<String>,
    pub roster: Roster,
    /// Counts channel opens. Work captured under one value is void under
    /// any other.
    pub connection: u64,
}

/// The single owner of client-side session state.
#[derive(Debug, Default)]
pub struct Session {
    state: SessionState,
    identity: Option<String>,
    pending_identity: Option<String>,
    roster: Roster,
    connection: u64,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Identity confirmed by the arbiter for the current connection.
    pub fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.state,
            identity: self.identity.clone(),
            roster: self.roster.clone(),
            connection: self.connection,
        }
    }

    /// Number of channel opens so far; identifies the current connection.
    pub fn connection(&self) -> u64 {
        self.connection
    }

    /// A channel opened. Starts a fresh, unregistered session.
    pub fn connected(&mut self) -> ClientEvent {
        if self.state.is_connected() {
            warn!(state = %self.state, "connected while a session was live; starting over");
        }
        self.state = SessionState::ConnectedUnregistered;
        self.connection += 1;
        self.identity = None;
        self.pending_identity = None;
        ClientEvent::Connected
    }

    /// The channel closed. Registration is void; the roster snapshot is kept.
    pub fn teardown(&mut self, reason: Option<String>) -> ClientEvent {
        debug!(state = %self.state, ?reason, "session teardown");
        self.state = SessionState::Disconnected;
        self.identity = None;
        self.pending_identity = None;
        ClientEvent::Disconnected { reason }
    }

    /// Admit `msg` for transmission in the current state. An admitted
    /// `register` records the requested name until the arbiter answers.
    ///
    /// # Errors
    ///
    /// - [`FaceshotError::NotConnected`] when no channel is open
    /// - [`FaceshotError::AlreadyRegistered`] for `register` after confirmation
    /// - [`FaceshotError::NotRegistered`] for `shoot` before confirmation
    pub fn admit_outbound(&mut self, msg: &ClientMessage) -> Result<()> {
        if !self.state.is_connected() {
            return Err(FaceshotError::NotConnected);
        }
        match msg {
            ClientMessage::Who => Ok(()),
            ClientMessage::Register { name, .. } => {
                if self.state == SessionState::ConnectedRegistered {
                    return Err(FaceshotError::AlreadyRegistered);
                }
                self.pending_identity = Some(name.clone());
                Ok(())
            }
            ClientMessage::Shoot { .. } => {
                if self.state == SessionState::ConnectedRegistered {
                    Ok(())
                } else {
                    Err(FaceshotError::NotRegistered)
                }
            }
        }
    }

    /// Apply one inbound arbiter message and return the resulting events.
    pub fn handle(&mut self, msg: ServerMessage) -> Vec<ClientEvent> {
        match msg {
            ServerMessage::Registered { name, hp } => self.on_registered(name, hp),
            ServerMessage::Players { list } => vec![self.replace_roster(list, RosterSource::Push)],
            ServerMessage::Hit {
                from,
                target,
                hp,
                score,
            } => {
                self.roster.set_health(&target, hp);
                let struck_me = self.identity.as_deref() == Some(target.as_str());
                let mut events = Vec::with_capacity(2);
                if struck_me {
                    info!(%from, hp, score, "hit by a shot");
                    events.push(ClientEvent::Hit {
                        from: from.clone(),
                        target,
                        hp,
                        score,
                    });
                    events.push(ClientEvent::Distress { from, hp, score });
                } else {
                    debug!(%from, %target, hp, score, "hit");
                    events.push(ClientEvent::Hit {
                        from,
                        target,
                        hp,
                        score,
                    });
                }
                events
            }
            ServerMessage::Miss { score } => vec![ClientEvent::Miss { score }],
            ServerMessage::Error { msg } => {
                warn!(message = %msg, "arbiter reported an error");
                vec![ClientEvent::ServerError { message: msg }]
            }
        }
    }

    /// Adopt a roster snapshot obtained by reconciliation.
    pub fn apply_pulled(&mut self, list: Vec<RosterEntry>) -> ClientEvent {
        self.replace_roster(list, RosterSource::Pull)
    }

    fn replace_roster(&mut self, list: Vec<RosterEntry>, source: RosterSource) -> ClientEvent {
        debug!(players = list.len(), ?source, "roster replaced");
        self.roster.replace(list.clone());
        ClientEvent::RosterReplaced {
            players: list,
            source,
        }
    }

    fn on_registered(&mut self, name: String, hp: i64) -> Vec<ClientEvent> {
        self.roster.set_health(&name, hp);

        if self.state == SessionState::ConnectedRegistered {
            if self.identity.as_deref() != Some(name.as_str()) {
                warn!(
                    identity = ?self.identity,
                    %name,
                    "registration ack for a different name; keeping identity"
                );
            } else {
                debug!(%name, "duplicate registration ack");
            }
            return Vec::new();
        }

        if let Some(pending) = self.pending_identity.take() {
            if pending != name {
                warn!(%pending, %name, "arbiter registered a different name than requested");
            }
        }

        info!(%name, hp, "registered");
        self.identity = Some(name.clone());
        self.state = SessionState::ConnectedRegistered;
        vec![ClientEvent::Registered { name, hp }]
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
    use crate::protocol::Signature;

    fn embedding() -> Signature {
        Signature::new(vec![0.1; 128])
    }

    fn registered(name: &str, hp: i64) -> ServerMessage {
        ServerMessage::Registered {
            name: name.into(),
            hp,
        }
    }

    fn hit(from: &str, target: &str, hp: i64) -> ServerMessage {
        ServerMessage::Hit {
            from: from.into(),
            target: target.into(),
            hp,
            score: 0.92,
        }
    }

    fn registered_session(name: &str) -> Session {
        let mut session = Session::new();
        session.connected();
        let register = ClientMessage::Register {
            name: name.into(),
            embedding: embedding(),
        };
        session.admit_outbound(&register).unwrap();
        session.handle(registered(name, 100));
        session
    }

    #[test]
    fn starts_disconnected() {
        let session = Session::new();
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(session.identity().is_none());
    }

    #[test]
    fn register_send_does_not_change_state() {
        let mut session = Session::new();
        session.connected();
        let register = ClientMessage::Register {
            name: "Alice".into(),
            embedding: embedding(),
        };
        session.admit_outbound(&register).unwrap();
        assert_eq!(session.state(), SessionState::ConnectedUnregistered);
        assert!(session.identity().is_none());
    }

    #[test]
    fn registered_ack_transitions_exactly_once() {
        let mut session = Session::new();
        session.connected();

        let first = session.handle(registered("Alice", 100));
        assert_eq!(
            first,
            vec![ClientEvent::Registered {
                name: "Alice".into(),
                hp: 100
            }]
        );
        assert_eq!(session.state(), SessionState::ConnectedRegistered);

        let second = session.handle(registered("Alice", 100));
        assert!(second.is_empty());
        assert_eq!(session.state(), SessionState::ConnectedRegistered);
        assert_eq!(session.identity(), Some("Alice"));
    }

    #[test]
    fn identity_is_not_replaced_by_later_ack() {
        let mut session = registered_session("Alice");
        session.handle(registered("Mallory", 100));
        assert_eq!(session.identity(), Some("Alice"));
    }

    #[test]
    fn shoot_requires_registration() {
        let shoot = ClientMessage::Shoot {
            embedding: embedding(),
        };

        let mut session = Session::new();
        assert!(matches!(
            session.admit_outbound(&shoot),
            Err(FaceshotError::NotConnected)
        ));

        session.connected();
        assert!(matches!(
            session.admit_outbound(&shoot),
            Err(FaceshotError::NotRegistered)
        ));

        let mut session = registered_session("Alice");
        assert!(session.admit_outbound(&shoot).is_ok());
    }

    #[test]
    fn register_after_confirmation_is_rejected() {
        let mut session = registered_session("Alice");
        let register = ClientMessage::Register {
            name: "Alice".into(),
            embedding: embedding(),
        };
        assert!(matches!(
            session.admit_outbound(&register),
            Err(FaceshotError::AlreadyRegistered)
        ));
    }

    #[test]
    fn teardown_returns_to_disconnected_from_any_state() {
        let mut fresh = Session::new();
        let mut open = Session::new();
        open.connected();
        let mut registered = registered_session("Alice");

        for session in [&mut fresh, &mut open, &mut registered] {
            let event = session.teardown(Some("gone".into()));
            assert_eq!(
                event,
                ClientEvent::Disconnected {
                    reason: Some("gone".into())
                }
            );
            assert_eq!(session.state(), SessionState::Disconnected);
            assert!(session.identity().is_none());
            let shoot = ClientMessage::Shoot {
                embedding: embedding(),
            };
            assert!(session.admit_outbound(&shoot).is_err());
        }
    }

    #[test]
    fn every_open_is_a_new_connection() {
        let mut session = Session::new();
        assert_eq!(session.connection(), 0);

        session.connected();
        let first = session.connection();
        session.teardown(None);
        assert_eq!(session.connection(), first);

        session.connected();
        assert_ne!(session.connection(), first);
        assert_eq!(session.snapshot().connection, session.connection());
    }

    #[test]
    fn hit_on_self_raises_distress() {
        let mut session = registered_session("Bob");
        let events = session.handle(hit("Alice", "Bob", 80));

        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], ClientEvent::Hit { target, hp: 80, .. } if target == "Bob"));
        assert!(matches!(&events[1], ClientEvent::Distress { from, hp: 80, .. } if from == "Alice"));
        assert_eq!(session.roster().get("Bob").unwrap().hp, 80);
    }

    #[test]
    fn hit_on_someone_else_only_updates_roster() {
        let mut session = registered_session("Alice");
        session.handle(ServerMessage::Players {
            list: vec![RosterEntry::new("Alice", 100), RosterEntry::new("Bob", 100)],
        });

        let events = session.handle(hit("Alice", "Bob", 80));

        assert_eq!(events.len(), 1);
        assert_eq!(session.roster().get("Bob").unwrap().hp, 80);
        assert_eq!(session.roster().get("Alice").unwrap().hp, 100);
    }

    #[test]
    fn miss_and_error_leave_state_alone() {
        let mut session = registered_session("Alice");
        let before = session.snapshot();

        assert_eq!(
            session.handle(ServerMessage::Miss { score: 0.31 }),
            vec![ClientEvent::Miss { score: 0.31 }]
        );
        assert_eq!(
            session.handle(ServerMessage::Error {
                msg: "name taken".into()
            }),
            vec![ClientEvent::ServerError {
                message: "name taken".into()
            }]
        );
        assert_eq!(session.snapshot(), before);
    }

    #[test]
    fn later_pull_wins_over_earlier_push() {
        let mut session = registered_session("Alice");
        session.handle(ServerMessage::Players {
            list: vec![RosterEntry::new("Alice", 100), RosterEntry::new("Bob", 90)],
        });
        let event = session.apply_pulled(vec![RosterEntry::new("Alice", 100)]);

        assert!(matches!(
            event,
            ClientEvent::RosterReplaced {
                source: RosterSource::Pull,
                ..
            }
        ));
        assert!(session.roster().get("Bob").is_none());
        assert_eq!(session.state(), SessionState::ConnectedRegistered);
    }

    #[test]
    fn reconnect_requires_fresh_registration() {
        let mut session = registered_session("Alice");
        session.teardown(None);
        session.connected();
        assert_eq!(session.state(), SessionState::ConnectedUnregistered);
        assert!(session.identity().is_none());
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;
        use std::collections::BTreeMap;

        #[derive(Debug, Clone)]
        enum Inbound {
            Players(Vec<(u8, i64)>),
            Hit(u8, i64),
            Pull(Vec<(u8, i64)>),
        }

        fn player_name(id: u8) -> String {
            format!("p{id}")
        }

        fn entries(list: &[(u8, i64)]) -> Vec<RosterEntry> {
            list.iter()
                .map(|(id, hp)| RosterEntry::new(player_name(*id), *hp))
                .collect()
        }

        // Names within one snapshot are unique, as the arbiter guarantees.
        fn snapshot() -> impl Strategy<Value = Vec<(u8, i64)>> {
            prop::collection::btree_map(0u8..6, 0i64..=100, 0..6)
                .prop_map(|players| players.into_iter().collect())
        }

        fn inbound() -> impl Strategy<Value = Inbound> {
            prop_oneof![
                snapshot().prop_map(Inbound::Players),
                (0u8..6, 0i64..=100).prop_map(|(id, hp)| Inbound::Hit(id, hp)),
                snapshot().prop_map(Inbound::Pull),
            ]
        }

        proptest! {
            /// Property: the projection equals the last full snapshot with every
            /// later hit applied in arrival order.
            #[test]
            fn prop_roster_follows_arrival_order(events in prop::collection::vec(inbound(), 0..40)) {
                let mut session = Session::new();
                session.connected();

                // Model: last snapshot, plus health overrides from hits after it.
                let mut base: Vec<RosterEntry> = Vec::new();
                let mut overrides: Vec<(String, i64)> = Vec::new();

                for event in events {
                    match event {
                        Inbound::Players(list) => {
                            base = entries(&list);
                            overrides.clear();
                            session.handle(ServerMessage::Players { list: entries(&list) });
                        }
                        Inbound::Pull(list) => {
                            base = entries(&list);
                            overrides.clear();
                            session.apply_pulled(entries(&list));
                        }
                        Inbound::Hit(id, hp) => {
                            overrides.push((player_name(id), hp));
                            session.handle(ServerMessage::Hit {
                                from: "shooter".into(),
                                target: player_name(id),
                                hp,
                                score: 0.9,
                            });
                        }
                    }
                }

                let mut latest: BTreeMap<String, i64> = BTreeMap::new();
                for (name, hp) in &overrides {
                    latest.insert(name.clone(), *hp);
                }
                for entry in session.roster().entries() {
                    let expected = latest
                        .get(&entry.name)
                        .copied()
                        .or_else(|| base.iter().find(|b| b.name == entry.name).map(|b| b.hp));
                    prop_assert_eq!(Some(entry.hp), expected);
                }
                for entry in &base {
                    prop_assert!(session.roster().get(&entry.name).is_some());
                }
                for name in latest.keys() {
                    prop_assert!(session.roster().get(name).is_some());
                }
            }

            /// Property: however many duplicate acks arrive, exactly one
            /// Registered event is produced.
            #[test]
            fn prop_registration_is_idempotent(acks in 1usize..8) {
                let mut session = Session::new();
                session.connected();
                let mut registered_events = 0;
                for _ in 0..acks {
                    registered_events += session
                        .handle(registered("Alice", 100))
                        .iter()
                        .filter(|e| matches!(e, ClientEvent::Registered { .. }))
                        .count();
                }
                prop_assert_eq!(registered_events, 1);
                prop_assert_eq!(session.state(), SessionState::ConnectedRegistered);
            }
        }
    }
}
