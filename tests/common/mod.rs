#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing,
    dead_code
)]
//! Shared test utilities for Faceshot client integration tests.
//!
//! Provides a loopback [`Connector`] whose far end is driven by the test as
//! a fake arbiter, a scripted [`SignatureExtractor`], a recording [`Sleeper`],
//! and helpers for building arbiter messages.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use faceshot_client::capture::{Detection, FaceRegion, SignatureExtractor, Sleeper};
use faceshot_client::protocol::{ClientMessage, RosterEntry, ServerMessage, Signature};
use faceshot_client::{ClientEvent, Connector, FaceshotError, Transport};
use tokio::sync::{mpsc, Notify};

/// How long a test waits for something that should happen promptly.
pub const PATIENCE: Duration = Duration::from_secs(2);

// ── Loopback arbiter ────────────────────────────────────────────────

/// Client half of one loopback connection.
struct LoopbackTransport {
    to_arbiter: mpsc::UnboundedSender<String>,
    from_arbiter: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn send(&mut self, message: String) -> Result<(), FaceshotError> {
        self.to_arbiter
            .send(message)
            .map_err(|e| FaceshotError::TransportSend(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<String, FaceshotError>> {
        self.from_arbiter.recv().await.map(Ok)
    }

    async fn close(&mut self) -> Result<(), FaceshotError> {
        Ok(())
    }
}

/// Arbiter half of one loopback connection.
pub struct ArbiterLink {
    from_client: mpsc::UnboundedReceiver<String>,
    to_client: Option<mpsc::UnboundedSender<String>>,
}

impl ArbiterLink {
    /// Next message the client sent on this connection.
    pub async fn expect_message(&mut self) -> ClientMessage {
        let raw = tokio::time::timeout(PATIENCE, self.from_client.recv())
            .await
            .expect("timed out waiting for a client message")
            .expect("client side of the link is gone");
        serde_json::from_str(&raw).expect("client sent invalid JSON")
    }

    /// Assert the client sends nothing more within a short window.
    pub async fn expect_silence(&mut self) {
        let next = tokio::time::timeout(Duration::from_millis(100), self.from_client.recv()).await;
        if let Ok(Some(raw)) = next {
            panic!("expected no client message, got {raw}");
        }
    }

    pub fn push(&self, msg: &ServerMessage) {
        self.push_raw(&serde_json::to_string(msg).unwrap());
    }

    pub fn push_raw(&self, text: &str) {
        self.to_client
            .as_ref()
            .expect("link already hung up")
            .send(text.to_string())
            .expect("client transport dropped");
    }

    /// Close the connection from the arbiter side.
    pub fn hang_up(&mut self) {
        self.to_client = None;
    }
}

/// Fake arbiter: accepts every connection the client opens.
pub struct Arbiter {
    links: mpsc::UnboundedReceiver<ArbiterLink>,
}

impl Arbiter {
    /// Wait for the client's next connection.
    pub async fn accept(&mut self) -> ArbiterLink {
        tokio::time::timeout(PATIENCE, self.links.recv())
            .await
            .expect("timed out waiting for the client to connect")
            .expect("connector dropped")
    }

    /// Returns `true` if the client has not opened any connection yet.
    pub fn no_pending_connection(&mut self) -> bool {
        self.links.try_recv().is_err()
    }
}

/// [`Connector`] that pairs each connection with an [`ArbiterLink`].
pub struct LoopbackConnector {
    links: mpsc::UnboundedSender<ArbiterLink>,
    refuse: Arc<AtomicBool>,
}

#[async_trait]
impl Connector for LoopbackConnector {
    async fn connect(&self, _url: &str) -> Result<Box<dyn Transport>, FaceshotError> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(FaceshotError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "arbiter unreachable",
            )));
        }
        let (to_arbiter, from_client) = mpsc::unbounded_channel();
        let (to_client, from_arbiter) = mpsc::unbounded_channel();
        self.links
            .send(ArbiterLink {
                from_client,
                to_client: Some(to_client),
            })
            .map_err(|_| FaceshotError::NotConnected)?;
        Ok(Box::new(LoopbackTransport {
            to_arbiter,
            from_arbiter,
        }))
    }
}

/// Create a connector plus the fake arbiter that answers it, and a switch
/// that makes further connection attempts fail.
pub fn loopback() -> (LoopbackConnector, Arbiter, Arc<AtomicBool>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let refuse = Arc::new(AtomicBool::new(false));
    (
        LoopbackConnector {
            links: tx,
            refuse: Arc::clone(&refuse),
        },
        Arbiter { links: rx },
        refuse,
    )
}

// ── Extractor and sleeper ───────────────────────────────────────────

/// Extractor that replays scripted frames, then repeats `fallback`.
///
/// When gated, every call waits for one [`Notify`] permit first, which lets a
/// test hold a capture "in flight".
#[derive(Clone)]
pub struct ScriptedExtractor {
    script: Arc<StdMutex<VecDeque<Option<Detection>>>>,
    fallback: Option<Detection>,
    gate: Option<Arc<Notify>>,
    pub calls: Arc<AtomicU32>,
}

impl ScriptedExtractor {
    /// Always sees `face`.
    pub fn always(face: Detection) -> Self {
        Self {
            script: Arc::new(StdMutex::new(VecDeque::new())),
            fallback: Some(face),
            gate: None,
            calls: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Never sees a face.
    pub fn blind() -> Self {
        Self {
            script: Arc::new(StdMutex::new(VecDeque::new())),
            fallback: None,
            gate: None,
            calls: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Replays `frames` in order, then sees nothing.
    pub fn scripted(frames: Vec<Option<Detection>>) -> Self {
        let extractor = Self::blind();
        *extractor.script.lock().unwrap() = frames.into();
        extractor
    }

    #[must_use]
    pub fn gated(mut self, gate: Arc<Notify>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SignatureExtractor for ScriptedExtractor {
    async fn extract(&self) -> Result<Option<Detection>, FaceshotError> {
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        self.calls.fetch_add(1, Ordering::SeqCst);
        let scripted = self.script.lock().unwrap().pop_front();
        Ok(scripted.unwrap_or_else(|| self.fallback.clone()))
    }
}

/// Sleeper that records requested delays and returns immediately.
#[derive(Clone, Default)]
pub struct RecordingSleeper {
    pub delays: Arc<StdMutex<Vec<Duration>>>,
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        self.delays.lock().unwrap().push(duration);
    }
}

// ── Fixtures ────────────────────────────────────────────────────────

/// A 128-component descriptor, the size face models commonly emit.
pub fn signature(seed: f32) -> Signature {
    Signature::new((0..128).map(|i| seed + i as f32 / 1000.0).collect())
}

pub fn face(seed: f32) -> Detection {
    Detection::new(signature(seed)).with_region(FaceRegion {
        x: 120.0,
        y: 80.0,
        width: 96.0,
        height: 96.0,
    })
}

pub fn registered(name: &str, hp: i64) -> ServerMessage {
    ServerMessage::Registered {
        name: name.into(),
        hp,
    }
}

pub fn players(list: &[(&str, i64)]) -> ServerMessage {
    ServerMessage::Players {
        list: roster(list),
    }
}

pub fn roster(list: &[(&str, i64)]) -> Vec<RosterEntry> {
    list.iter()
        .map(|(name, hp)| RosterEntry::new(*name, *hp))
        .collect()
}

pub fn hit(from: &str, target: &str, hp: i64, score: f64) -> ServerMessage {
    ServerMessage::Hit {
        from: from.into(),
        target: target.into(),
        hp,
        score,
    }
}

/// Next event, failing the test if none arrives promptly.
pub async fn next_event(events: &mut mpsc::Receiver<ClientEvent>) -> ClientEvent {
    tokio::time::timeout(PATIENCE, events.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event channel closed")
}
