//! # Terminal Duel
//!
//! Plays a real session against a running arbiter from the terminal:
//!
//! 1. Connect over WebSocket and reconcile the roster over HTTP
//! 2. `join <name>` registers with the current face
//! 3. `shoot` fires at whoever is in frame
//! 4. `roster` prints the local roster projection
//! 5. `quit` (or Ctrl+C) shuts down
//!
//! No camera is involved. The "face in frame" is a JSON array of numbers in
//! the file named by `FACESHOT_SIGNATURE_FILE`; swap its contents to aim at
//! someone else. A missing file means no face is visible.
//!
//! ## Running
//!
//! ```sh
//! FACESHOT_WS_URL=ws://localhost:8765 \
//! FACESHOT_API_URL=http://localhost:8080 \
//! FACESHOT_SIGNATURE_FILE=face.json \
//!     cargo run --example terminal_duel
//! ```

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;

use async_trait::async_trait;
use faceshot_client::{
    ClientEvent, Collaborators, Detection, FaceshotClient, FaceshotConfig, FaceshotError,
    SignatureExtractor, Signature,
};
use tokio::io::{AsyncBufReadExt, BufReader};

const DEFAULT_WS_URL: &str = "ws://localhost:8765";
const DEFAULT_API_URL: &str = "http://localhost:8080";
const DEFAULT_SIGNATURE_FILE: &str = "face.json";

// ─────────────────────────────────────────────────────────────────────
// A file stands in for the camera
// ─────────────────────────────────────────────────────────────────────

/// Reads the signature of the "face in frame" from a JSON file on every call.
struct FileExtractor {
    path: PathBuf,
}

#[async_trait]
impl SignatureExtractor for FileExtractor {
    async fn extract(&self) -> Result<Option<Detection>, FaceshotError> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let signature: Signature = serde_json::from_str(&raw)
            .map_err(|e| FaceshotError::Extractor(format!("{}: {e}", self.path.display())))?;
        Ok(Some(Detection::new(signature)))
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// A `join` or `shoot` whose capture is still running.
type Action<'a> = Pin<Box<dyn Future<Output = Result<(), FaceshotError>> + 'a>>;

/// Await the pending action; pending forever with none.
async fn next_outcome(action: &mut Option<Action<'_>>) -> Result<(), FaceshotError> {
    match action {
        Some(action) => action.as_mut().await,
        None => std::future::pending().await,
    }
}

fn print_help() {
    println!("commands: join <name> | shoot | roster | quit");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // ── Logging ─────────────────────────────────────────────────────
    // Set `RUST_LOG=debug` for verbose output.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // ── Configuration ───────────────────────────────────────────────
    let ws_url = env_or("FACESHOT_WS_URL", DEFAULT_WS_URL);
    let api_url = env_or("FACESHOT_API_URL", DEFAULT_API_URL);
    let extractor = FileExtractor {
        path: env_or("FACESHOT_SIGNATURE_FILE", DEFAULT_SIGNATURE_FILE).into(),
    };
    tracing::info!(%ws_url, %api_url, "starting");

    let config = FaceshotConfig::new(ws_url).with_roster_url(api_url);
    let (mut client, mut event_rx) = FaceshotClient::start(config, Collaborators::websocket(extractor));

    if let Err(e) = client.open().await {
        tracing::warn!("arbiter not reachable yet ({e}); `join` will retry");
    }
    print_help();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut action: Option<Action<'_>> = None;
    let client_ref = &client;

    loop {
        tokio::select! {
            event = event_rx.recv() => {
                let Some(event) = event else {
                    tracing::info!("event channel closed, exiting");
                    break;
                };
                match event {
                    ClientEvent::Connected => println!("* connected"),
                    ClientEvent::Registered { name, hp } => {
                        println!("* registered as {name} ({hp} hp), fire away");
                    }
                    ClientEvent::RosterReplaced { .. } => {}
                    ClientEvent::Hit { from, target, hp, score } => {
                        println!("* {from} hit {target} -> {hp} hp (score {score:.2})");
                    }
                    ClientEvent::Distress { from, hp, .. } => {
                        println!("!!! HIT by {from}, {hp} hp left !!!");
                    }
                    ClientEvent::Miss { score } => println!("* miss (best score {score:.2})"),
                    ClientEvent::ServerError { message } => println!("* arbiter: {message}"),
                    ClientEvent::Disconnected { reason } => {
                        println!(
                            "* disconnected ({}); `join` to reconnect",
                            reason.as_deref().unwrap_or("closed by arbiter")
                        );
                    }
                }
            }

            outcome = next_outcome(&mut action), if action.is_some() => {
                action = None;
                if let Err(e) = outcome {
                    println!("* {e}");
                }
            }

            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                let line = line.trim();
                let (cmd, arg) = line.split_once(' ').unwrap_or((line, ""));
                match cmd {
                    "join" | "shoot" if action.is_some() => println!("* still capturing, hold on"),
                    "join" => {
                        let name = arg.to_owned();
                        println!("* hold still, capturing…");
                        action = Some(Box::pin(async move { client_ref.join(&name).await }));
                    }
                    "shoot" => action = Some(Box::pin(client_ref.shoot())),
                    "roster" => println!("{} | {}", client.session_state(), client.roster()),
                    "quit" | "exit" => break,
                    "" => {}
                    _ => print_help(),
                }
            }

            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Ctrl+C received, shutting down");
                break;
            }
        }
    }

    drop(action);
    client.shutdown().await;
    Ok(())
}
