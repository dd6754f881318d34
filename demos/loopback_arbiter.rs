//! # Loopback Arbiter
//!
//! Runs a complete duel without a network or a camera: a small in-process
//! arbiter sits behind a custom [`Connector`], and a scripted extractor plays
//! the camera. Useful as a template for testing presentation code, or for
//! adapting the client to another I/O layer.
//!
//! ## Running
//!
//! ```sh
//! cargo run --example loopback_arbiter
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use faceshot_client::protocol::{ClientMessage, RosterEntry, ServerMessage};
use faceshot_client::{
    ClientEvent, Collaborators, Connector, Detection, FaceshotClient, FaceshotConfig,
    FaceshotError, SessionState, Signature, SignatureExtractor, Transport,
};
use tokio::sync::mpsc;

// ─────────────────────────────────────────────────────────────────────
// Step 1: a channel-backed transport and connector
// ─────────────────────────────────────────────────────────────────────

struct LoopbackTransport {
    tx: mpsc::UnboundedSender<String>,
    rx: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn send(&mut self, message: String) -> Result<(), FaceshotError> {
        self.tx
            .send(message)
            .map_err(|e| FaceshotError::TransportSend(e.to_string()))
    }

    /// Cancel-safe because `UnboundedReceiver::recv` is.
    async fn recv(&mut self) -> Option<Result<String, FaceshotError>> {
        self.rx.recv().await.map(Ok)
    }

    async fn close(&mut self) -> Result<(), FaceshotError> {
        Ok(())
    }
}

/// Spawns a fresh [`Arbiter`] task for every connection.
struct LoopbackConnector;

#[async_trait]
impl Connector for LoopbackConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn Transport>, FaceshotError> {
        tracing::info!(%url, "loopback connect");
        let (client_tx, arbiter_rx) = mpsc::unbounded_channel();
        let (arbiter_tx, client_rx) = mpsc::unbounded_channel();
        tokio::spawn(Arbiter::seeded().serve(arbiter_rx, arbiter_tx));
        Ok(Box::new(LoopbackTransport {
            tx: client_tx,
            rx: client_rx,
        }))
    }
}

// ─────────────────────────────────────────────────────────────────────
// Step 2: a toy arbiter
// ─────────────────────────────────────────────────────────────────────

const MATCH_THRESHOLD: f64 = 0.8;
const DAMAGE: i64 = 20;

struct Player {
    name: String,
    hp: i64,
    face: Signature,
}

struct Arbiter {
    players: Vec<Player>,
    me: Option<String>,
}

impl Arbiter {
    /// An arena with one opponent already registered.
    fn seeded() -> Self {
        Self {
            players: vec![Player {
                name: "Bob".into(),
                hp: 100,
                face: bob_face(),
            }],
            me: None,
        }
    }

    async fn serve(
        mut self,
        mut rx: mpsc::UnboundedReceiver<String>,
        tx: mpsc::UnboundedSender<String>,
    ) {
        while let Some(raw) = rx.recv().await {
            let replies = match serde_json::from_str::<ClientMessage>(&raw) {
                Ok(msg) => self.on_message(msg),
                Err(e) => vec![ServerMessage::Error {
                    msg: format!("bad message: {e}"),
                }],
            };
            for reply in replies {
                let Ok(json) = serde_json::to_string(&reply) else {
                    continue;
                };
                if tx.send(json).is_err() {
                    return;
                }
            }
        }
    }

    fn on_message(&mut self, msg: ClientMessage) -> Vec<ServerMessage> {
        match msg {
            ClientMessage::Who => vec![self.roster()],
            ClientMessage::Register { name, embedding } => {
                if self.players.iter().any(|p| p.name == name) {
                    return vec![ServerMessage::Error {
                        msg: format!("{name} is already taken"),
                    }];
                }
                self.players.push(Player {
                    name: name.clone(),
                    hp: 100,
                    face: embedding,
                });
                self.me = Some(name.clone());
                vec![ServerMessage::Registered { name, hp: 100 }, self.roster()]
            }
            ClientMessage::Shoot { embedding } => {
                let shooter = self.me.clone().unwrap_or_default();
                let best = self
                    .players
                    .iter_mut()
                    .filter(|p| p.name != shooter)
                    .map(|p| (cosine(&embedding, &p.face), p))
                    .max_by(|a, b| a.0.total_cmp(&b.0));
                match best {
                    Some((score, target)) if score >= MATCH_THRESHOLD => {
                        target.hp -= DAMAGE;
                        vec![ServerMessage::Hit {
                            from: shooter,
                            target: target.name.clone(),
                            hp: target.hp,
                            score,
                        }]
                    }
                    Some((score, _)) => vec![ServerMessage::Miss { score }],
                    None => vec![ServerMessage::Miss { score: 0.0 }],
                }
            }
        }
    }

    fn roster(&self) -> ServerMessage {
        ServerMessage::Players {
            list: self
                .players
                .iter()
                .map(|p| RosterEntry::new(p.name.clone(), p.hp))
                .collect(),
        }
    }
}

fn cosine(a: &Signature, b: &Signature) -> f64 {
    let (mut dot, mut na, mut nb) = (0.0f64, 0.0f64, 0.0f64);
    for (x, y) in a.as_slice().iter().zip(b.as_slice()) {
        let (x, y) = (f64::from(*x), f64::from(*y));
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na.sqrt() * nb.sqrt())
    }
}

// ─────────────────────────────────────────────────────────────────────
// Step 3: a scripted camera
// ─────────────────────────────────────────────────────────────────────

fn alice_face() -> Signature {
    Signature::new(vec![0.9, 0.1, 0.0, 0.2])
}

fn bob_face() -> Signature {
    Signature::new(vec![0.0, 0.2, 0.95, 0.1])
}

/// Sees Alice first (for registration), then alternates between an empty
/// frame and Bob.
struct ScriptedCamera {
    frame: AtomicUsize,
}

#[async_trait]
impl SignatureExtractor for ScriptedCamera {
    async fn extract(&self) -> Result<Option<Detection>, FaceshotError> {
        let frame = self.frame.fetch_add(1, Ordering::Relaxed);
        Ok(match frame {
            0 => Some(Detection::new(alice_face())),
            n if n % 2 == 1 => None,
            _ => Some(Detection::new(bob_face())),
        })
    }
}

// ─────────────────────────────────────────────────────────────────────
// Step 4: play
// ─────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let camera = ScriptedCamera {
        frame: AtomicUsize::new(0),
    };
    let (mut client, mut event_rx) = FaceshotClient::start(
        FaceshotConfig::new("loopback://arena"),
        Collaborators::new(LoopbackConnector, camera),
    );

    client.join("Alice").await?;
    client
        .wait_for_state(SessionState::ConnectedRegistered)
        .await?;
    tracing::info!("registered; roster: {}", client.roster());

    // Five trigger pulls: empty frames fail locally, Bob's face lands.
    for _ in 0..5 {
        match client.shoot().await {
            Ok(()) => tracing::info!("shot fired"),
            Err(e) => tracing::info!("shot not fired: {e}"),
        }
    }

    let mut hits = 0;
    while hits < 2 {
        let Some(event) = event_rx.recv().await else {
            break;
        };
        match event {
            ClientEvent::Hit {
                target, hp, score, ..
            } => {
                tracing::info!("hit {target}: {hp} hp left (score {score:.3})");
                hits += 1;
            }
            ClientEvent::Miss { score } => tracing::info!("miss (score {score:.3})"),
            other => tracing::debug!(?other, "event"),
        }
    }

    tracing::info!("final roster: {}", client.roster());
    client.shutdown().await;
    Ok(())
}
