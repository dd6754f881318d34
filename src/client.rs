//! Async client handle and background session loop.
//!
//! [`FaceshotClient`] is a cheap handle. Captures run in the caller's task;
//! everything that touches session state goes through an unbounded command
//! queue to one background loop, which owns the [`Session`] and the live
//! [`Transport`]. The loop publishes a [`SessionSnapshot`] after every change
//! and emits [`ClientEvent`]s on a bounded channel returned from
//! [`FaceshotClient::start`].
//!
//! # Example
//!
//! ```rust,ignore
//! let config = FaceshotConfig::new("wss://arbiter.example:8765")
//!     .with_roster_url("https://arbiter.example:8080");
//! let (client, mut events) = FaceshotClient::start(config, Collaborators::websocket(camera));
//!
//! client.join("Alice").await?;
//! client.wait_for_state(SessionState::ConnectedRegistered).await?;
//! client.shoot().await?;
//!
//! while let Some(event) = events.recv().await {
//!     match event {
//!         ClientEvent::Distress { from, hp, .. } => { /* flash the screen */ }
//!         ClientEvent::Disconnected { .. } => break,
//!         _ => {}
//!     }
//! }
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::capture::{self, CapturePolicy, Detection, SignatureExtractor, Sleeper, TokioSleeper};
use crate::error::{FaceshotError, Result};
use crate::event::ClientEvent;
use crate::protocol::{ClientMessage, RosterEntry, ServerMessage};
use crate::reconcile::{self, RosterFetcher};
use crate::roster::Roster;
use crate::session::{Session, SessionSnapshot, SessionState};
use crate::transport::{Connector, Transport};

/// Default capacity of the bounded event channel.
const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 256;

/// Default timeout for the graceful shutdown.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Default roster reconciliation period.
const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(4);

/// Shortest accepted reconciliation period.
const MIN_RECONCILE_INTERVAL: Duration = Duration::from_millis(100);

/// Default HTTP timeout for one roster pull.
const DEFAULT_ROSTER_TIMEOUT: Duration = Duration::from_secs(5);

/// Registration retries while the player settles in front of the camera.
const DEFAULT_JOIN_ATTEMPTS: u32 = 10;
const DEFAULT_JOIN_RETRY_DELAY: Duration = Duration::from_millis(300);

// ── Configuration ───────────────────────────────────────────────────

/// Configuration for a [`FaceshotClient`].
///
/// The only required field is the session channel URL; everything else has a
/// default.
///
/// # Example
///
/// ```
/// use faceshot_client::client::FaceshotConfig;
/// use faceshot_client::capture::CapturePolicy;
/// use std::time::Duration;
///
/// let config = FaceshotConfig::new("ws://localhost:8765")
///     .with_roster_url("http://localhost:8080")
///     .with_join_capture(CapturePolicy::new(5, Duration::from_millis(200)));
/// assert_eq!(config.join_capture.max_attempts, 5);
/// assert_eq!(config.reconcile_interval, Duration::from_secs(4));
/// ```
#[derive(Debug, Clone)]
pub struct FaceshotConfig {
    /// Session channel endpoint (`ws://` or `wss://`).
    pub server_url: String,
    /// Base URL of the arbiter's HTTP side channel. Reconciliation is
    /// disabled when `None`.
    pub roster_url: Option<String>,
    /// Period between roster pulls. Defaults to **4 seconds**; values below
    /// 100 ms are clamped.
    pub reconcile_interval: Duration,
    /// Request timeout for one roster pull. Defaults to **5 seconds**.
    pub roster_timeout: Duration,
    /// Capture budget for `join`. Defaults to **10 attempts, 300 ms apart**.
    pub join_capture: CapturePolicy,
    /// Capture budget for `shoot`. Defaults to **a single attempt**, since a
    /// shot aims at whatever is in frame right now.
    pub shoot_capture: CapturePolicy,
    /// Capacity of the bounded event channel.
    ///
    /// When the consumer falls behind, events are dropped (with a warning)
    /// rather than stalling the session loop. `Disconnected` is always
    /// delivered. Defaults to **256**; values below 1 are clamped to 1.
    pub event_channel_capacity: usize,
    /// Time the session loop gets to close the channel on
    /// [`FaceshotClient::shutdown`] before it is aborted. Defaults to
    /// **1 second**.
    pub shutdown_timeout: Duration,
}

impl FaceshotConfig {
    /// Create a configuration for the given session channel URL.
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            roster_url: None,
            reconcile_interval: DEFAULT_RECONCILE_INTERVAL,
            roster_timeout: DEFAULT_ROSTER_TIMEOUT,
            join_capture: CapturePolicy::new(DEFAULT_JOIN_ATTEMPTS, DEFAULT_JOIN_RETRY_DELAY),
            shoot_capture: CapturePolicy::single(),
            event_channel_capacity: DEFAULT_EVENT_CHANNEL_CAPACITY,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }

    /// Enable reconciliation against the arbiter's HTTP base URL.
    #[must_use]
    pub fn with_roster_url(mut self, roster_url: impl Into<String>) -> Self {
        self.roster_url = Some(roster_url.into());
        self
    }

    /// Set the reconciliation period (clamped to at least 100 ms).
    #[must_use]
    pub fn with_reconcile_interval(mut self, interval: Duration) -> Self {
        self.reconcile_interval = interval.max(MIN_RECONCILE_INTERVAL);
        self
    }

    #[must_use]
    pub fn with_roster_timeout(mut self, timeout: Duration) -> Self {
        self.roster_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_join_capture(mut self, policy: CapturePolicy) -> Self {
        self.join_capture = policy;
        self
    }

    #[must_use]
    pub fn with_shoot_capture(mut self, policy: CapturePolicy) -> Self {
        self.shoot_capture = policy;
        self
    }

    /// Set the capacity of the bounded event channel (at least 1).
    #[must_use]
    pub fn with_event_channel_capacity(mut self, capacity: usize) -> Self {
        self.event_channel_capacity = capacity.max(1);
        self
    }

    #[must_use]
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

// ── Collaborators ───────────────────────────────────────────────────

/// External systems the client drives: how to reach the arbiter, how to read
/// a face, how to wait between attempts, and (optionally) how to pull the
/// roster.
pub struct Collaborators {
    connector: Arc<dyn Connector>,
    extractor: Arc<dyn SignatureExtractor>,
    sleeper: Arc<dyn Sleeper>,
    roster_fetcher: Option<Arc<dyn RosterFetcher>>,
}

impl Collaborators {
    /// Collaborators with real-time retry delays and no explicit roster
    /// fetcher (one is built from [`FaceshotConfig::roster_url`] when the
    /// `roster-http` feature is enabled).
    pub fn new(connector: impl Connector, extractor: impl SignatureExtractor) -> Self {
        Self {
            connector: Arc::new(connector),
            extractor: Arc::new(extractor),
            sleeper: Arc::new(TokioSleeper),
            roster_fetcher: None,
        }
    }

    /// Collaborators that reach the arbiter over WebSocket.
    #[cfg(feature = "transport-websocket")]
    pub fn websocket(extractor: impl SignatureExtractor) -> Self {
        Self::new(crate::transports::WebSocketConnector::new(), extractor)
    }

    #[must_use]
    pub fn with_sleeper(mut self, sleeper: impl Sleeper) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    #[must_use]
    pub fn with_roster_fetcher(mut self, fetcher: impl RosterFetcher) -> Self {
        self.roster_fetcher = Some(Arc::new(fetcher));
        self
    }
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborators")
            .field("has_roster_fetcher", &self.roster_fetcher.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(feature = "roster-http")]
fn default_roster_fetcher(config: &FaceshotConfig) -> Option<Arc<dyn RosterFetcher>> {
    let url = config.roster_url.as_deref()?;
    match reconcile::HttpRosterFetcher::new(url, config.roster_timeout) {
        Ok(fetcher) => Some(Arc::new(fetcher)),
        Err(e) => {
            warn!(error = %e, "roster reconciliation disabled");
            None
        }
    }
}

#[cfg(not(feature = "roster-http"))]
fn default_roster_fetcher(config: &FaceshotConfig) -> Option<Arc<dyn RosterFetcher>> {
    if config.roster_url.is_some() {
        warn!("roster_url set but the `roster-http` feature is disabled; reconciliation off");
    }
    None
}

// ── Intents and in-flight guards ────────────────────────────────────

/// A user action that requires a face capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Join,
    Shoot,
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Join => "join",
            Self::Shoot => "shoot",
        })
    }
}

/// Marks an intent as in flight until dropped.
struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn acquire(flag: &'a AtomicBool, intent: Intent) -> Result<Self> {
        if flag.swap(true, Ordering::AcqRel) {
            return Err(FaceshotError::ActionInProgress(intent));
        }
        Ok(Self(flag))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

// ── Commands ────────────────────────────────────────────────────────

/// Work items for the session loop, applied strictly in queue order.
enum Command {
    Open {
        reply: oneshot::Sender<Result<()>>,
    },
    /// A captured message, void unless `connection` is still current.
    Send {
        msg: ClientMessage,
        connection: u64,
    },
    RosterPulled(Vec<RosterEntry>),
    Close,
}

// ── Client handle ───────────────────────────────────────────────────

/// Async client handle for the face-duel arbiter.
///
/// Created via [`FaceshotClient::start`], which spawns the background session
/// loop (and the reconciliation task when a roster source is available) and
/// returns this handle together with an event receiver.
pub struct FaceshotClient {
    cmd_tx: mpsc::UnboundedSender<Command>,
    snapshot_rx: watch::Receiver<SessionSnapshot>,
    extractor: Arc<dyn SignatureExtractor>,
    sleeper: Arc<dyn Sleeper>,
    join_capture: CapturePolicy,
    shoot_capture: CapturePolicy,
    join_in_flight: AtomicBool,
    shoot_in_flight: AtomicBool,
    task: Option<tokio::task::JoinHandle<()>>,
    reconcile_task: Option<tokio::task::JoinHandle<()>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    shutdown_timeout: Duration,
}

impl FaceshotClient {
    /// Spawn the session loop and return a handle plus event receiver.
    ///
    /// The client starts `Disconnected`; call [`open`](Self::open) or
    /// [`join`](Self::join) to connect.
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use = "the event receiver must be used to receive events"]
    pub fn start(
        config: FaceshotConfig,
        collaborators: Collaborators,
    ) -> (Self, mpsc::Receiver<ClientEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<Command>();
        let (event_tx, event_rx) = mpsc::channel::<ClientEvent>(config.event_channel_capacity.max(1));
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (snapshot_tx, snapshot_rx) = watch::channel(SessionSnapshot::default());

        let Collaborators {
            connector,
            extractor,
            sleeper,
            roster_fetcher,
        } = collaborators;

        let driver = SessionDriver {
            session: Session::new(),
            transport: None,
            connector,
            server_url: config.server_url.clone(),
            event_tx,
            snapshot_tx,
        };
        let task = tokio::spawn(driver.run(cmd_rx, shutdown_rx));

        let reconcile_task = roster_fetcher
            .or_else(|| default_roster_fetcher(&config))
            .map(|fetcher| {
                let tx = cmd_tx.clone();
                let period = config.reconcile_interval.max(MIN_RECONCILE_INTERVAL);
                tokio::spawn(reconcile::run_reconciliation(fetcher, period, move |players| {
                    tx.send(Command::RosterPulled(players)).is_ok()
                }))
            });

        let client = Self {
            cmd_tx,
            snapshot_rx,
            extractor,
            sleeper,
            join_capture: config.join_capture,
            shoot_capture: config.shoot_capture,
            join_in_flight: AtomicBool::new(false),
            shoot_in_flight: AtomicBool::new(false),
            task: Some(task),
            reconcile_task,
            shutdown_tx: Some(shutdown_tx),
            shutdown_timeout: config.shutdown_timeout,
        };

        (client, event_rx)
    }

    // ── Public API methods ──────────────────────────────────────────

    /// Open the session channel. Returns immediately if it is already open.
    ///
    /// On success the state is `ConnectedUnregistered` and a `who` probe has
    /// been sent.
    ///
    /// # Errors
    ///
    /// Returns the connector's error (e.g. [`FaceshotError::Io`],
    /// [`FaceshotError::Timeout`]) if the connection cannot be established, or
    /// [`FaceshotError::NotConnected`] after shutdown.
    pub async fn open(&self) -> Result<()> {
        let (reply, reply_rx) = oneshot::channel();
        self.command(Command::Open { reply })?;
        reply_rx.await.map_err(|_| FaceshotError::NotConnected)?
    }

    /// Register as `name` with a freshly captured face.
    ///
    /// Opens the channel first if needed. Returns once the `register` message
    /// is queued; the state becomes `ConnectedRegistered` only when the
    /// arbiter acknowledges (see [`ClientEvent::Registered`] and
    /// [`wait_for_state`](Self::wait_for_state)).
    ///
    /// A capture that outlives its connection is discarded, even if the
    /// channel has been reopened meanwhile.
    ///
    /// # Errors
    ///
    /// - [`FaceshotError::EmptyIdentity`] if `name` is blank
    /// - [`FaceshotError::ActionInProgress`] if another `join` is capturing
    /// - [`FaceshotError::AlreadyRegistered`] if the arbiter already confirmed
    /// - [`FaceshotError::FaceNotFound`] if no face was detected in budget
    /// - any error from [`open`](Self::open)
    pub async fn join(&self, name: &str) -> Result<()> {
        let name = name.trim();
        if name.is_empty() {
            return Err(FaceshotError::EmptyIdentity);
        }
        let _in_flight = InFlight::acquire(&self.join_in_flight, Intent::Join)?;

        let (state, connection) = {
            let snapshot = self.snapshot_rx.borrow();
            (snapshot.state, snapshot.connection)
        };
        let connection = match state {
            SessionState::ConnectedRegistered => return Err(FaceshotError::AlreadyRegistered),
            SessionState::ConnectedUnregistered => connection,
            SessionState::Disconnected => {
                self.open().await?;
                self.snapshot_rx.borrow().connection
            }
        };

        info!(%name, "hold still: capturing face for registration");
        let detection = self.capture(Intent::Join, self.join_capture).await?;

        self.command(Command::Send {
            msg: ClientMessage::Register {
                name: name.to_owned(),
                embedding: detection.signature,
            },
            connection,
        })
    }

    /// Fire: capture the face in frame and submit it to the arbiter.
    ///
    /// The outcome arrives as [`ClientEvent::Hit`] or [`ClientEvent::Miss`].
    /// A shot captured on a connection that has since closed is discarded.
    ///
    /// # Errors
    ///
    /// - [`FaceshotError::NotRegistered`] unless the state is
    ///   `ConnectedRegistered` (nothing is sent)
    /// - [`FaceshotError::ActionInProgress`] if another `shoot` is capturing
    /// - [`FaceshotError::FaceNotFound`] if no face was detected (nothing is sent)
    pub async fn shoot(&self) -> Result<()> {
        let connection = {
            let snapshot = self.snapshot_rx.borrow();
            if snapshot.state != SessionState::ConnectedRegistered {
                return Err(FaceshotError::NotRegistered);
            }
            snapshot.connection
        };
        let _in_flight = InFlight::acquire(&self.shoot_in_flight, Intent::Shoot)?;

        let detection = self.capture(Intent::Shoot, self.shoot_capture).await?;

        self.command(Command::Send {
            msg: ClientMessage::Shoot {
                embedding: detection.signature,
            },
            connection,
        })
    }

    /// Close the session channel. The client can be reopened later.
    ///
    /// # Errors
    ///
    /// Returns [`FaceshotError::NotConnected`] after shutdown.
    pub fn close(&self) -> Result<()> {
        self.command(Command::Close)
    }

    /// Shut down the client, closing the channel and stopping background tasks.
    ///
    /// The event receiver yields `None` once the session loop exits.
    pub async fn shutdown(&mut self) {
        debug!("FaceshotClient: shutdown requested");

        if let Some(task) = self.reconcile_task.take() {
            task.abort();
        }

        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }

        if let Some(mut task) = self.task.take() {
            match tokio::time::timeout(self.shutdown_timeout, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(join_err)) => {
                    warn!("session loop terminated with join error: {join_err}");
                }
                Err(_) => {
                    warn!("session loop did not exit within timeout; aborting task");
                    task.abort();
                    if let Err(join_err) = task.await {
                        debug!("session loop aborted: {join_err}");
                    }
                }
            }
        }
    }

    // ── State accessors ─────────────────────────────────────────────

    /// Latest published copy of the session.
    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    pub fn session_state(&self) -> SessionState {
        self.snapshot_rx.borrow().state
    }

    /// Identity confirmed by the arbiter, if registered.
    pub fn identity(&self) -> Option<String> {
        self.snapshot_rx.borrow().identity.clone()
    }

    pub fn roster(&self) -> Roster {
        self.snapshot_rx.borrow().roster.clone()
    }

    /// Wait until the published state equals `state`.
    ///
    /// # Errors
    ///
    /// Returns [`FaceshotError::NotConnected`] if the session loop exits first.
    pub async fn wait_for_state(&self, state: SessionState) -> Result<()> {
        let mut rx = self.snapshot_rx.clone();
        loop {
            if rx.borrow_and_update().state == state {
                return Ok(());
            }
            rx.changed().await.map_err(|_| FaceshotError::NotConnected)?;
        }
    }

    // ── Internal helpers ────────────────────────────────────────────

    async fn capture(&self, intent: Intent, policy: CapturePolicy) -> Result<Detection> {
        capture::capture(self.extractor.as_ref(), self.sleeper.as_ref(), policy)
            .await
            .inspect_err(|e| info!(%intent, "capture failed: {e}"))
    }

    fn command(&self, cmd: Command) -> Result<()> {
        self.cmd_tx
            .send(cmd)
            .map_err(|_| FaceshotError::NotConnected)
    }
}

impl fmt::Debug for FaceshotClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FaceshotClient")
            .field("state", &self.session_state())
            .field("identity", &self.identity())
            .field("has_task", &self.task.is_some())
            .field("reconciling", &self.reconcile_task.is_some())
            .finish()
    }
}

impl Drop for FaceshotClient {
    fn drop(&mut self) {
        // No executor context for an async close here; abort instead.
        if let Some(task) = self.reconcile_task.take() {
            task.abort();
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

// ── Session loop ────────────────────────────────────────────────────

/// Owns the [`Session`] and the live transport. The only mutator of
/// client-side state.
struct SessionDriver {
    session: Session,
    transport: Option<Box<dyn Transport>>,
    connector: Arc<dyn Connector>,
    server_url: String,
    event_tx: mpsc::Sender<ClientEvent>,
    snapshot_tx: watch::Sender<SessionSnapshot>,
}

impl SessionDriver {
    /// Multiplex commands, shutdown, and inbound frames via `tokio::select!`.
    ///
    /// Exits when the command channel closes (every handle and the
    /// reconciliation task dropped) or on the shutdown signal.
    async fn run(
        mut self,
        mut cmd_rx: mpsc::UnboundedReceiver<Command>,
        mut shutdown_rx: oneshot::Receiver<()>,
    ) {
        debug!("session loop started");

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(cmd) => self.on_command(cmd).await,
                        None => {
                            debug!("command channel closed, stopping session loop");
                            self.disconnect(Some("client shut down".into()), true).await;
                            break;
                        }
                    }
                }

                _ = &mut shutdown_rx => {
                    debug!("shutdown signal received");
                    self.disconnect(Some("client shut down".into()), true).await;
                    break;
                }

                incoming = next_frame(&mut self.transport), if self.transport.is_some() => {
                    match incoming {
                        Some(Ok(text)) => self.on_frame(&text).await,
                        Some(Err(e)) => {
                            error!("transport receive error: {e}");
                            self.disconnect(Some(format!("transport receive error: {e}")), false)
                                .await;
                        }
                        None => {
                            debug!("session channel closed by arbiter");
                            self.disconnect(None, false).await;
                        }
                    }
                }
            }
        }

        debug!("session loop exited");
    }

    async fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::Open { reply } => {
                let result = self.open().await;
                let _ = reply.send(result);
            }
            Command::Send { msg, connection } => {
                if connection == self.session.connection() {
                    self.transmit(msg).await;
                } else {
                    debug!(
                        message = kind(&msg),
                        captured_on = connection,
                        current = self.session.connection(),
                        "captured on an earlier connection; dropping"
                    );
                }
            }
            Command::RosterPulled(players) => {
                let event = self.session.apply_pulled(players);
                self.publish();
                emit_event(&self.event_tx, event);
            }
            Command::Close => {
                if self.transport.is_some() {
                    self.disconnect(Some("closed by client".into()), true).await;
                } else {
                    debug!("close requested with no open channel");
                }
            }
        }
    }

    async fn open(&mut self) -> Result<()> {
        if self.transport.is_some() {
            debug!("open requested while already connected");
            return Ok(());
        }

        let transport = self.connector.connect(&self.server_url).await.map_err(|e| {
            warn!(url = %self.server_url, "failed to open session channel: {e}");
            e
        })?;
        self.transport = Some(transport);

        let event = self.session.connected();
        self.publish();
        emit_event(&self.event_tx, event);

        // Let the arbiter resynchronize a client that reconnected mid-session.
        self.transmit(ClientMessage::Who).await;
        if self.transport.is_none() {
            return Err(FaceshotError::TransportClosed);
        }
        Ok(())
    }

    async fn transmit(&mut self, msg: ClientMessage) {
        let Some(transport) = self.transport.as_mut() else {
            debug!(message = kind(&msg), "session channel closed; dropping outbound message");
            return;
        };

        if let Err(e) = self.session.admit_outbound(&msg) {
            warn!(message = kind(&msg), "not sent: {e}");
            return;
        }

        let json = match serde_json::to_string(&msg) {
            Ok(json) => json,
            Err(e) => {
                error!("failed to serialize ClientMessage: {e}");
                return;
            }
        };

        debug!(message = kind(&msg), "sending");
        if let Err(e) = transport.send(json).await {
            error!("transport send error: {e}");
            self.disconnect(Some(format!("transport send error: {e}")), false)
                .await;
        }
    }

    async fn on_frame(&mut self, text: &str) {
        match serde_json::from_str::<ServerMessage>(text) {
            Ok(msg) => {
                let events = self.session.handle(msg);
                self.publish();
                for event in events {
                    emit_event(&self.event_tx, event);
                }
            }
            Err(e) => warn!("failed to deserialize arbiter message: {e}; raw: {text}"),
        }
    }

    /// Tear the connection down. `close` requests a graceful close of the
    /// transport (not needed when the transport already failed).
    async fn disconnect(&mut self, reason: Option<String>, close: bool) {
        let Some(mut transport) = self.transport.take() else {
            return;
        };
        if close {
            if let Err(e) = transport.close().await {
                debug!("error closing transport: {e}");
            }
        }

        let event = self.session.teardown(reason);
        self.publish();
        // Always delivered: the presentation must disable firing.
        if self.event_tx.send(event).await.is_err() {
            debug!("event channel closed, receiver dropped");
        }
    }

    fn publish(&self) {
        self.snapshot_tx.send_replace(self.session.snapshot());
    }
}

/// Await the next inbound frame; pending forever with no transport.
async fn next_frame(transport: &mut Option<Box<dyn Transport>>) -> Option<Result<String>> {
    match transport {
        Some(transport) => transport.recv().await,
        None => std::future::pending().await,
    }
}

fn kind(msg: &ClientMessage) -> &'static str {
    match msg {
        ClientMessage::Who => "who",
        ClientMessage::Register { .. } => "register",
        ClientMessage::Shoot { .. } => "shoot",
    }
}

/// Emit an event without blocking the session loop. If the channel is full,
/// log a warning and drop the event.
fn emit_event(event_tx: &mpsc::Sender<ClientEvent>, event: ClientEvent) {
    match event_tx.try_send(event) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(dropped)) => {
            warn!("event channel full, dropping event: {dropped:?}");
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            debug!("event channel closed, receiver dropped");
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────

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
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    /// Connector whose transports record sent frames and never receive.
    struct SilentConnector {
        sent: Arc<StdMutex<Vec<String>>>,
    }

    struct SilentTransport {
        sent: Arc<StdMutex<Vec<String>>>,
    }

    #[async_trait]
    impl Transport for SilentTransport {
        async fn send(&mut self, message: String) -> Result<()> {
            self.sent.lock().unwrap().push(message);
            Ok(())
        }

        async fn recv(&mut self) -> Option<Result<String>> {
            std::future::pending().await
        }

        async fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl Connector for SilentConnector {
        async fn connect(&self, _url: &str) -> Result<Box<dyn Transport>> {
            Ok(Box::new(SilentTransport {
                sent: Arc::clone(&self.sent),
            }))
        }
    }

    struct AlwaysFace;

    #[async_trait]
    impl SignatureExtractor for AlwaysFace {
        async fn extract(&self) -> Result<Option<Detection>> {
            Ok(Some(Detection::new(Signature::new(vec![0.25; 4]))))
        }
    }

    fn start_silent() -> (FaceshotClient, mpsc::Receiver<ClientEvent>, Arc<StdMutex<Vec<String>>>) {
        let sent = Arc::new(StdMutex::new(Vec::new()));
        let connector = SilentConnector {
            sent: Arc::clone(&sent),
        };
        let (client, events) = FaceshotClient::start(
            FaceshotConfig::new("ws://arbiter.test"),
            Collaborators::new(connector, AlwaysFace),
        );
        (client, events, sent)
    }

    #[test]
    fn config_defaults() {
        let config = FaceshotConfig::new("ws://arbiter.test");
        assert_eq!(config.server_url, "ws://arbiter.test");
        assert!(config.roster_url.is_none());
        assert_eq!(config.reconcile_interval, Duration::from_secs(4));
        assert_eq!(config.join_capture, CapturePolicy::new(10, Duration::from_millis(300)));
        assert_eq!(config.shoot_capture.max_attempts, 1);
        assert_eq!(config.event_channel_capacity, 256);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(1));
    }

    #[test]
    fn config_clamps_degenerate_values() {
        let config = FaceshotConfig::new("ws://arbiter.test")
            .with_event_channel_capacity(0)
            .with_reconcile_interval(Duration::ZERO);
        assert_eq!(config.event_channel_capacity, 1);
        assert_eq!(config.reconcile_interval, MIN_RECONCILE_INTERVAL);
    }

    #[test]
    fn in_flight_guard_rejects_overlap_and_releases_on_drop() {
        let flag = AtomicBool::new(false);
        let guard = InFlight::acquire(&flag, Intent::Shoot).unwrap();
        assert!(matches!(
            InFlight::acquire(&flag, Intent::Shoot),
            Err(FaceshotError::ActionInProgress(Intent::Shoot))
        ));
        drop(guard);
        assert!(InFlight::acquire(&flag, Intent::Shoot).is_ok());
    }

    #[tokio::test]
    async fn open_sends_who_and_is_idempotent() {
        let (mut client, mut events, sent) = start_silent();
        assert_eq!(client.session_state(), SessionState::Disconnected);

        client.open().await.unwrap();
        client.open().await.unwrap();

        assert_eq!(events.recv().await.unwrap(), ClientEvent::Connected);
        assert_eq!(client.session_state(), SessionState::ConnectedUnregistered);
        assert_eq!(*sent.lock().unwrap(), vec![r#"{"type":"who"}"#.to_string()]);

        client.shutdown().await;
    }

    #[tokio::test]
    async fn close_resets_to_disconnected() {
        let (mut client, mut events, _sent) = start_silent();
        client.open().await.unwrap();
        let _ = events.recv().await; // Connected

        client.close().unwrap();
        let ev = events.recv().await.unwrap();
        assert!(matches!(ev, ClientEvent::Disconnected { .. }));
        assert_eq!(client.session_state(), SessionState::Disconnected);

        client.shutdown().await;
    }

    #[tokio::test]
    async fn commands_fail_after_shutdown() {
        let (mut client, _events, _sent) = start_silent();
        client.shutdown().await;
        assert!(matches!(client.open().await, Err(FaceshotError::NotConnected)));
        assert!(matches!(client.close(), Err(FaceshotError::NotConnected)));
    }
}
