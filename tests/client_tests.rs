#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
//! End-to-end tests for `FaceshotClient` against an in-process fake arbiter.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::*;
use faceshot_client::protocol::{ClientMessage, RosterEntry, ServerMessage};
use faceshot_client::{
    CapturePolicy, ClientEvent, Collaborators, FaceshotClient, FaceshotConfig, FaceshotError,
    Intent, RosterFetcher, RosterSource, SessionState,
};
use tokio::sync::{mpsc, Notify};
use tokio_test::{assert_err, assert_ok};

// ════════════════════════════════════════════════════════════════════
// Harness
// ════════════════════════════════════════════════════════════════════

struct Harness {
    client: FaceshotClient,
    events: mpsc::Receiver<ClientEvent>,
    arbiter: Arbiter,
    refuse: Arc<AtomicBool>,
    sleeper: RecordingSleeper,
    extractor: ScriptedExtractor,
}

fn config() -> FaceshotConfig {
    FaceshotConfig::new("ws://arbiter.test")
}

fn start(extractor: ScriptedExtractor) -> Harness {
    start_with(config(), extractor, None)
}

fn start_with(
    config: FaceshotConfig,
    extractor: ScriptedExtractor,
    fetcher: Option<ReadyFetcher>,
) -> Harness {
    let (connector, arbiter, refuse) = loopback();
    let sleeper = RecordingSleeper::default();
    let mut collaborators =
        Collaborators::new(connector, extractor.clone()).with_sleeper(sleeper.clone());
    if let Some(fetcher) = fetcher {
        collaborators = collaborators.with_roster_fetcher(fetcher);
    }
    let (client, events) = FaceshotClient::start(config, collaborators);
    Harness {
        client,
        events,
        arbiter,
        refuse,
        sleeper,
        extractor,
    }
}

/// Join as `name` and have the arbiter confirm it. Consumes the `who`,
/// `register`, `Connected` and `Registered` traffic.
async fn register_as(h: &mut Harness, name: &str) -> ArbiterLink {
    assert_ok!(h.client.join(name).await);
    let mut link = h.arbiter.accept().await;
    assert_eq!(link.expect_message().await, ClientMessage::Who);
    assert!(matches!(
        link.expect_message().await,
        ClientMessage::Register { name: sent, .. } if sent == name
    ));

    link.push(&registered(name, 100));
    tokio::time::timeout(
        PATIENCE,
        h.client.wait_for_state(SessionState::ConnectedRegistered),
    )
    .await
    .expect("registration never confirmed")
    .unwrap();

    assert_eq!(next_event(&mut h.events).await, ClientEvent::Connected);
    assert!(matches!(
        next_event(&mut h.events).await,
        ClientEvent::Registered { name: confirmed, hp: 100 } if confirmed == name
    ));
    link
}

async fn expect_no_event(events: &mut mpsc::Receiver<ClientEvent>) {
    if let Ok(Some(ev)) = tokio::time::timeout(Duration::from_millis(100), events.recv()).await {
        panic!("unexpected event: {ev:?}");
    }
}

/// Roster source that fails until switched on, then serves a fixed list.
#[derive(Clone)]
struct ReadyFetcher {
    ready: Arc<AtomicBool>,
    list: Vec<RosterEntry>,
}

#[async_trait]
impl RosterFetcher for ReadyFetcher {
    async fn fetch(&self) -> Result<Vec<RosterEntry>, FaceshotError> {
        if self.ready.load(Ordering::SeqCst) {
            Ok(self.list.clone())
        } else {
            Err(FaceshotError::RosterFetch("not yet".into()))
        }
    }
}

// ════════════════════════════════════════════════════════════════════
// Registration
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn join_sends_register_and_waits_for_confirmation() {
    let mut h = start(ScriptedExtractor::always(face(0.1)));

    assert_ok!(h.client.join("Alice").await);
    let mut link = h.arbiter.accept().await;
    assert_eq!(link.expect_message().await, ClientMessage::Who);
    assert_eq!(
        link.expect_message().await,
        ClientMessage::Register {
            name: "Alice".into(),
            embedding: signature(0.1),
        }
    );

    // Not registered until the arbiter says so.
    assert_eq!(h.client.session_state(), SessionState::ConnectedUnregistered);
    assert_eq!(h.client.identity(), None);
    assert!(matches!(
        h.client.shoot().await,
        Err(FaceshotError::NotRegistered)
    ));

    link.push(&registered("Alice", 100));
    assert_eq!(next_event(&mut h.events).await, ClientEvent::Connected);
    assert_eq!(
        next_event(&mut h.events).await,
        ClientEvent::Registered {
            name: "Alice".into(),
            hp: 100
        }
    );
    assert_eq!(h.client.session_state(), SessionState::ConnectedRegistered);
    assert_eq!(h.client.identity().as_deref(), Some("Alice"));
    assert_eq!(h.client.roster().get("Alice").map(|e| e.hp), Some(100));

    h.client.shutdown().await;
}

#[tokio::test]
async fn join_trims_whitespace_from_the_name() {
    let mut h = start(ScriptedExtractor::always(face(0.2)));
    assert_ok!(h.client.join("  Bob \n").await);

    let mut link = h.arbiter.accept().await;
    let _who = link.expect_message().await;
    assert!(matches!(
        link.expect_message().await,
        ClientMessage::Register { name, .. } if name == "Bob"
    ));

    h.client.shutdown().await;
}

#[tokio::test]
async fn blank_name_is_rejected_without_connecting() {
    let mut h = start(ScriptedExtractor::always(face(0.1)));

    assert!(matches!(
        h.client.join("   ").await,
        Err(FaceshotError::EmptyIdentity)
    ));
    assert!(matches!(
        h.client.join("").await,
        Err(FaceshotError::EmptyIdentity)
    ));

    assert!(h.arbiter.no_pending_connection());
    assert_eq!(h.extractor.call_count(), 0);
    assert_eq!(h.client.session_state(), SessionState::Disconnected);

    h.client.shutdown().await;
}

#[tokio::test]
async fn join_gives_up_after_the_capture_budget() {
    let config = config().with_join_capture(CapturePolicy::new(3, Duration::from_millis(50)));
    let mut h = start_with(config, ScriptedExtractor::blind(), None);

    assert!(matches!(
        h.client.join("Alice").await,
        Err(FaceshotError::FaceNotFound { attempts: 3 })
    ));

    assert_eq!(h.extractor.call_count(), 3);
    assert_eq!(
        *h.sleeper.delays.lock().unwrap(),
        vec![Duration::from_millis(50); 2]
    );

    // The channel stays open, but only the probe went out.
    let mut link = h.arbiter.accept().await;
    assert_eq!(link.expect_message().await, ClientMessage::Who);
    link.expect_silence().await;
    assert_eq!(h.client.session_state(), SessionState::ConnectedUnregistered);
    assert_eq!(next_event(&mut h.events).await, ClientEvent::Connected);
    expect_no_event(&mut h.events).await;

    h.client.shutdown().await;
}

#[tokio::test]
async fn join_retries_until_a_face_appears() {
    let extractor = ScriptedExtractor::scripted(vec![None, None, Some(face(0.3))]);
    let mut h = start(extractor);

    assert_ok!(h.client.join("Alice").await);

    assert_eq!(h.extractor.call_count(), 3);
    assert_eq!(h.sleeper.delays.lock().unwrap().len(), 2);
    let mut link = h.arbiter.accept().await;
    let _who = link.expect_message().await;
    assert!(matches!(
        link.expect_message().await,
        ClientMessage::Register { embedding, .. } if embedding == signature(0.3)
    ));

    h.client.shutdown().await;
}

#[tokio::test]
async fn join_after_confirmation_is_rejected() {
    let mut h = start(ScriptedExtractor::always(face(0.1)));
    let mut link = register_as(&mut h, "Alice").await;
    let calls = h.extractor.call_count();

    assert!(matches!(
        h.client.join("Alice").await,
        Err(FaceshotError::AlreadyRegistered)
    ));
    assert_eq!(h.extractor.call_count(), calls);
    link.expect_silence().await;

    h.client.shutdown().await;
}

#[tokio::test]
async fn duplicate_confirmation_transitions_once() {
    let mut h = start(ScriptedExtractor::always(face(0.1)));
    let link = register_as(&mut h, "Alice").await;

    link.push(&registered("Alice", 100));
    link.push(&ServerMessage::Miss { score: 0.2 });

    // The duplicate produced nothing; the miss comes straight after.
    assert_eq!(
        next_event(&mut h.events).await,
        ClientEvent::Miss { score: 0.2 }
    );
    assert_eq!(h.client.identity().as_deref(), Some("Alice"));

    h.client.shutdown().await;
}

#[tokio::test]
async fn connect_failure_leaves_the_client_disconnected() {
    let mut h = start(ScriptedExtractor::always(face(0.1)));
    h.refuse.store(true, Ordering::SeqCst);

    let err = assert_err!(h.client.join("Alice").await);
    assert!(matches!(err, FaceshotError::Io(_)));
    assert_eq!(h.client.session_state(), SessionState::Disconnected);
    assert_eq!(h.extractor.call_count(), 0);

    // The arbiter comes back; the same handle can try again.
    h.refuse.store(false, Ordering::SeqCst);
    assert_ok!(h.client.join("Alice").await);
    let mut link = h.arbiter.accept().await;
    assert_eq!(link.expect_message().await, ClientMessage::Who);

    h.client.shutdown().await;
}

// ════════════════════════════════════════════════════════════════════
// Firing
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn shoot_before_registration_sends_nothing() {
    let mut h = start(ScriptedExtractor::always(face(0.1)));

    // Disconnected.
    assert!(matches!(
        h.client.shoot().await,
        Err(FaceshotError::NotRegistered)
    ));

    // Connected but unregistered.
    h.client.open().await.unwrap();
    let mut link = h.arbiter.accept().await;
    assert_eq!(link.expect_message().await, ClientMessage::Who);
    assert!(matches!(
        h.client.shoot().await,
        Err(FaceshotError::NotRegistered)
    ));

    link.expect_silence().await;
    assert_eq!(h.extractor.call_count(), 0);

    h.client.shutdown().await;
}

#[tokio::test]
async fn shoot_submits_a_fresh_capture_and_applies_the_hit() {
    let extractor = ScriptedExtractor::scripted(vec![Some(face(0.1)), Some(face(0.7))]);
    let mut h = start(extractor);
    let mut link = register_as(&mut h, "Alice").await;
    link.push(&players(&[("Alice", 100), ("Bob", 100)]));
    let _ = next_event(&mut h.events).await;

    assert_ok!(h.client.shoot().await);
    assert_eq!(
        link.expect_message().await,
        ClientMessage::Shoot {
            embedding: signature(0.7)
        }
    );

    link.push(&hit("Alice", "Bob", 80, 0.92));
    assert_eq!(
        next_event(&mut h.events).await,
        ClientEvent::Hit {
            from: "Alice".into(),
            target: "Bob".into(),
            hp: 80,
            score: 0.92,
        }
    );
    // Not our face: no distress.
    expect_no_event(&mut h.events).await;
    assert_eq!(h.client.roster().to_string(), "Alice(100), Bob(80)");

    h.client.shutdown().await;
}

#[tokio::test]
async fn shoot_without_a_face_sends_nothing() {
    let extractor = ScriptedExtractor::scripted(vec![Some(face(0.1))]);
    let mut h = start(extractor);
    let mut link = register_as(&mut h, "Alice").await;

    assert!(matches!(
        h.client.shoot().await,
        Err(FaceshotError::FaceNotFound { attempts: 1 })
    ));
    link.expect_silence().await;
    // A single attempt never waits.
    assert!(h.sleeper.delays.lock().unwrap().is_empty());

    h.client.shutdown().await;
}

#[tokio::test]
async fn being_hit_raises_distress_after_the_hit() {
    let mut h = start(ScriptedExtractor::always(face(0.4)));
    let link = register_as(&mut h, "Bob").await;

    link.push(&hit("Alice", "Bob", 80, 0.92));

    assert!(matches!(
        next_event(&mut h.events).await,
        ClientEvent::Hit { target, hp: 80, .. } if target == "Bob"
    ));
    assert_eq!(
        next_event(&mut h.events).await,
        ClientEvent::Distress {
            from: "Alice".into(),
            hp: 80,
            score: 0.92,
        }
    );
    assert_eq!(h.client.roster().get("Bob").map(|e| e.hp), Some(80));

    h.client.shutdown().await;
}

#[tokio::test]
async fn overlapping_shots_are_rejected() {
    let gate = Arc::new(Notify::new());
    let mut h = start(ScriptedExtractor::always(face(0.1)).gated(Arc::clone(&gate)));
    gate.notify_one(); // let the join capture through
    let mut link = register_as(&mut h, "Alice").await;

    let client = &h.client;
    let (first, second, ()) = tokio::join!(client.shoot(), client.shoot(), async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        gate.notify_one();
    });

    let results = [first, second];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results
        .iter()
        .any(|r| matches!(r, Err(FaceshotError::ActionInProgress(Intent::Shoot)))));

    assert!(matches!(
        link.expect_message().await,
        ClientMessage::Shoot { .. }
    ));
    link.expect_silence().await;

    h.client.shutdown().await;
}

#[tokio::test]
async fn arbiter_events_flow_while_a_capture_is_in_progress() {
    let gate = Arc::new(Notify::new());
    let mut h = start(ScriptedExtractor::always(face(0.1)).gated(Arc::clone(&gate)));
    gate.notify_one();
    let mut link = register_as(&mut h, "Alice").await;

    let client = &h.client;
    let events = &mut h.events;
    let link_ref = &link;
    let (shot, seen) = tokio::join!(client.shoot(), async {
        link_ref.push(&players(&[("Alice", 100), ("Carol", 100)]));
        let ev = next_event(events).await;
        gate.notify_one();
        ev
    });

    assert_ok!(shot);
    assert!(matches!(
        seen,
        ClientEvent::RosterReplaced { source: RosterSource::Push, .. }
    ));
    assert!(matches!(
        link.expect_message().await,
        ClientMessage::Shoot { .. }
    ));

    h.client.shutdown().await;
}

#[tokio::test]
async fn shot_captured_across_a_disconnect_is_dropped() {
    let gate = Arc::new(Notify::new());
    let mut h = start(ScriptedExtractor::always(face(0.1)).gated(Arc::clone(&gate)));
    gate.notify_one();
    let mut link = register_as(&mut h, "Alice").await;

    let client = &h.client;
    let events = &mut h.events;
    let link_ref = &mut link;
    let (shot, ()) = tokio::join!(client.shoot(), async {
        link_ref.hang_up();
        assert_eq!(
            next_event(events).await,
            ClientEvent::Disconnected { reason: None }
        );
        gate.notify_one();
    });

    // Capture succeeded, but the session loop refuses to send it.
    assert_ok!(shot);
    link.expect_silence().await;
    assert_eq!(h.client.session_state(), SessionState::Disconnected);

    h.client.shutdown().await;
}

#[tokio::test]
async fn registration_captured_before_a_reopen_is_not_sent() {
    let gate = Arc::new(Notify::new());
    let mut h = start(ScriptedExtractor::always(face(0.1)).gated(Arc::clone(&gate)));

    let client = &h.client;
    let arbiter = &mut h.arbiter;
    let events = &mut h.events;
    let (joined, mut second) = tokio::join!(client.join("Alice"), async {
        let mut first = arbiter.accept().await;
        assert_eq!(first.expect_message().await, ClientMessage::Who);
        assert_eq!(next_event(events).await, ClientEvent::Connected);

        first.hang_up();
        assert_eq!(
            next_event(events).await,
            ClientEvent::Disconnected { reason: None }
        );

        // Reopen without joining again, then let the old capture finish.
        client.open().await.unwrap();
        let mut second = arbiter.accept().await;
        assert_eq!(second.expect_message().await, ClientMessage::Who);
        gate.notify_one();
        second
    });

    assert_ok!(joined);
    second.expect_silence().await;
    assert_eq!(h.client.session_state(), SessionState::ConnectedUnregistered);
    assert_eq!(h.client.identity(), None);

    h.client.shutdown().await;
}

#[tokio::test]
async fn shot_captured_before_reregistration_is_not_sent() {
    let gate = Arc::new(Notify::new());
    let mut h = start(ScriptedExtractor::always(face(0.1)).gated(Arc::clone(&gate)));
    gate.notify_one();
    let mut first = register_as(&mut h, "Alice").await;

    let client = &h.client;
    let arbiter = &mut h.arbiter;
    let events = &mut h.events;
    let first_ref = &mut first;
    let (shot, mut second) = tokio::join!(client.shoot(), async {
        first_ref.hang_up();
        assert_eq!(
            next_event(events).await,
            ClientEvent::Disconnected { reason: None }
        );

        // A new connection on which the arbiter already knows us.
        client.open().await.unwrap();
        let mut second = arbiter.accept().await;
        assert_eq!(second.expect_message().await, ClientMessage::Who);
        second.push(&registered("Alice", 100));
        client
            .wait_for_state(SessionState::ConnectedRegistered)
            .await
            .unwrap();
        gate.notify_one();
        second
    });

    // Registered on the new connection, yet the old shot stays unsent.
    assert_ok!(shot);
    second.expect_silence().await;
    assert_eq!(h.client.session_state(), SessionState::ConnectedRegistered);

    h.client.shutdown().await;
}

// ════════════════════════════════════════════════════════════════════
// Arbiter messages
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn miss_and_error_are_surfaced_verbatim() {
    let mut h = start(ScriptedExtractor::always(face(0.1)));
    let link = register_as(&mut h, "Alice").await;

    link.push(&ServerMessage::Miss { score: 0.41 });
    link.push(&ServerMessage::Error {
        msg: "Name already taken".into(),
    });

    assert_eq!(
        next_event(&mut h.events).await,
        ClientEvent::Miss { score: 0.41 }
    );
    assert_eq!(
        next_event(&mut h.events).await,
        ClientEvent::ServerError {
            message: "Name already taken".into()
        }
    );
    assert_eq!(h.client.session_state(), SessionState::ConnectedRegistered);

    h.client.shutdown().await;
}

#[tokio::test]
async fn unreadable_frames_are_skipped() {
    let mut h = start(ScriptedExtractor::always(face(0.1)));
    h.client.open().await.unwrap();
    let link = h.arbiter.accept().await;
    assert_eq!(next_event(&mut h.events).await, ClientEvent::Connected);

    link.push_raw("{not json");
    link.push_raw(r#"{"type":"teleport","to":"moon"}"#);
    link.push(&players(&[("Alice", 100)]));

    assert!(matches!(
        next_event(&mut h.events).await,
        ClientEvent::RosterReplaced { players, .. } if players.len() == 1
    ));
    assert!(h.client.session_state().is_connected());

    h.client.shutdown().await;
}

#[tokio::test]
async fn players_push_replaces_the_whole_roster() {
    let mut h = start(ScriptedExtractor::always(face(0.1)));
    let link = register_as(&mut h, "Alice").await;

    link.push(&players(&[("Alice", 100), ("Bob", 100), ("Carol", 60)]));
    link.push(&players(&[("Carol", 60), ("Alice", 100)]));
    let _ = next_event(&mut h.events).await;
    let _ = next_event(&mut h.events).await;

    assert_eq!(h.client.roster().to_string(), "Carol(60), Alice(100)");

    h.client.shutdown().await;
}

// ════════════════════════════════════════════════════════════════════
// Channel lifecycle
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn arbiter_hang_up_voids_registration() {
    let mut h = start(ScriptedExtractor::always(face(0.1)));
    let mut link = register_as(&mut h, "Alice").await;

    link.hang_up();

    assert_eq!(
        next_event(&mut h.events).await,
        ClientEvent::Disconnected { reason: None }
    );
    assert_eq!(h.client.session_state(), SessionState::Disconnected);
    assert_eq!(h.client.identity(), None);
    assert!(matches!(
        h.client.shoot().await,
        Err(FaceshotError::NotRegistered)
    ));

    h.client.shutdown().await;
}

#[tokio::test]
async fn reopening_after_close_requires_a_new_join() {
    let mut h = start(ScriptedExtractor::always(face(0.1)));
    let _first = register_as(&mut h, "Alice").await;

    h.client.close().unwrap();
    assert_eq!(
        next_event(&mut h.events).await,
        ClientEvent::Disconnected {
            reason: Some("closed by client".into())
        }
    );
    // The last known roster outlives the channel.
    assert_eq!(h.client.roster().get("Alice").map(|e| e.hp), Some(100));

    let _second = register_as(&mut h, "Alice").await;
    assert_eq!(h.client.session_state(), SessionState::ConnectedRegistered);

    h.client.shutdown().await;
}

#[tokio::test]
async fn shutdown_delivers_disconnected_then_ends_the_stream() {
    let mut h = start(ScriptedExtractor::always(face(0.1)));
    let _link = register_as(&mut h, "Alice").await;

    h.client.shutdown().await;

    assert_eq!(
        next_event(&mut h.events).await,
        ClientEvent::Disconnected {
            reason: Some("client shut down".into())
        }
    );
    assert!(h.events.recv().await.is_none());
}

// ════════════════════════════════════════════════════════════════════
// Reconciliation
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn later_pull_overrides_earlier_push() {
    let fetcher = ReadyFetcher {
        ready: Arc::new(AtomicBool::new(false)),
        list: roster(&[("Alice", 100)]),
    };
    let ready = Arc::clone(&fetcher.ready);
    let config = config().with_reconcile_interval(Duration::from_millis(100));
    let mut h = start_with(config, ScriptedExtractor::always(face(0.1)), Some(fetcher));

    h.client.open().await.unwrap();
    let link = h.arbiter.accept().await;
    assert_eq!(next_event(&mut h.events).await, ClientEvent::Connected);

    link.push(&players(&[("Alice", 100), ("Bob", 80)]));
    assert!(matches!(
        next_event(&mut h.events).await,
        ClientEvent::RosterReplaced { source: RosterSource::Push, .. }
    ));

    ready.store(true, Ordering::SeqCst);
    assert_eq!(
        next_event(&mut h.events).await,
        ClientEvent::RosterReplaced {
            players: roster(&[("Alice", 100)]),
            source: RosterSource::Pull,
        }
    );
    assert!(h.client.roster().get("Bob").is_none());

    h.client.shutdown().await;
}

#[tokio::test]
async fn pulls_continue_while_disconnected() {
    let fetcher = ReadyFetcher {
        ready: Arc::new(AtomicBool::new(true)),
        list: roster(&[("Alice", 90), ("Bob", 70)]),
    };
    let config = config().with_reconcile_interval(Duration::from_millis(100));
    let mut h = start_with(config, ScriptedExtractor::always(face(0.1)), Some(fetcher));

    assert!(matches!(
        next_event(&mut h.events).await,
        ClientEvent::RosterReplaced { source: RosterSource::Pull, .. }
    ));
    assert_eq!(h.client.session_state(), SessionState::Disconnected);
    assert_eq!(h.client.roster().to_string(), "Alice(90), Bob(70)");

    h.client.shutdown().await;
}
