//! Periodic roster reconciliation over the arbiter's HTTP side channel.
//!
//! Push events on the session channel can be missed (dropped frames, a
//! reconnect in between). Reconciliation pulls the full roster on a fixed
//! interval as a best-effort backstop. Failures are logged and swallowed; a
//! pull never touches session state.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, trace};

use crate::error::Result;
use crate::protocol::RosterEntry;

/// Path of the roster endpoint, relative to the configured base URL.
pub const ROSTER_PATH: &str = "/api/players";

/// Reads the full roster from the arbiter, independently of the session channel.
#[async_trait]
pub trait RosterFetcher: Send + Sync + 'static {
    /// Fetch one roster snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`FaceshotError::RosterFetch`](crate::FaceshotError::RosterFetch)
    /// on network failures, non-success status codes, and malformed bodies.
    async fn fetch(&self) -> Result<Vec<RosterEntry>>;
}

#[cfg(feature = "roster-http")]
pub use http::HttpRosterFetcher;

#[cfg(feature = "roster-http")]
mod http {
    use std::time::Duration;

    use async_trait::async_trait;

    use super::{RosterFetcher, ROSTER_PATH};
    use crate::error::{FaceshotError, Result};
    use crate::protocol::RosterEntry;

    /// [`RosterFetcher`] issuing `GET {base_url}/api/players` with `reqwest`.
    #[derive(Debug, Clone)]
    pub struct HttpRosterFetcher {
        client: reqwest::Client,
        url: String,
    }

    impl HttpRosterFetcher {
        /// Build a fetcher for the arbiter's HTTP base URL.
        ///
        /// # Errors
        ///
        /// Returns [`FaceshotError::RosterFetch`] if the HTTP client cannot be built.
        pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
            let client = reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .map_err(|e| FaceshotError::RosterFetch(e.to_string()))?;
            Ok(Self {
                client,
                url: format!("{}{ROSTER_PATH}", base_url.trim_end_matches('/')),
            })
        }

        /// The full URL this fetcher polls.
        pub fn url(&self) -> &str {
            &self.url
        }
    }

    #[async_trait]
    impl RosterFetcher for HttpRosterFetcher {
        async fn fetch(&self) -> Result<Vec<RosterEntry>> {
            self.client
                .get(&self.url)
                .send()
                .await
                .and_then(reqwest::Response::error_for_status)
                .map_err(|e| FaceshotError::RosterFetch(e.to_string()))?
                .json::<Vec<RosterEntry>>()
                .await
                .map_err(|e| FaceshotError::RosterFetch(e.to_string()))
        }
    }
}

/// Poll `fetcher` every `period` and hand each snapshot to `deliver`.
///
/// The first poll happens one full period after the call. Fetch failures are
/// swallowed. Returns once `deliver` reports that the consumer is gone
/// (returns `false`).
pub async fn run_reconciliation<F>(fetcher: Arc<dyn RosterFetcher>, period: Duration, mut deliver: F)
where
    F: FnMut(Vec<RosterEntry>) -> bool + Send,
{
    let mut ticker = time::interval_at(time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    debug!(?period, "roster reconciliation started");

    loop {
        ticker.tick().await;
        match fetcher.fetch().await {
            Ok(players) => {
                trace!(players = players.len(), "pulled roster");
                if !deliver(players) {
                    debug!("roster consumer gone, stopping reconciliation");
                    return;
                }
            }
            Err(e) => debug!(error = %e, "roster pull failed"),
        }
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
    use crate::error::FaceshotError;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    struct Scripted(Mutex<VecDeque<Result<Vec<RosterEntry>>>>);

    #[async_trait]
    impl RosterFetcher for Scripted {
        async fn fetch(&self) -> Result<Vec<RosterEntry>> {
            self.0
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(FaceshotError::RosterFetch("script exhausted".into())))
        }
    }

    #[tokio::test]
    async fn failures_are_swallowed_and_snapshots_delivered_in_order() {
        let fetcher = Arc::new(Scripted(Mutex::new(VecDeque::from(vec![
            Err(FaceshotError::RosterFetch("connection refused".into())),
            Ok(vec![RosterEntry::new("Alice", 100)]),
            Err(FaceshotError::RosterFetch("bad json".into())),
            Ok(vec![RosterEntry::new("Alice", 100), RosterEntry::new("Bob", 60)]),
        ]))));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let task = tokio::spawn(run_reconciliation(
            fetcher,
            Duration::from_millis(5),
            move |players| tx.send(players).is_ok(),
        ));

        let first = rx.recv().await.unwrap();
        assert_eq!(first, vec![RosterEntry::new("Alice", 100)]);
        let second = rx.recv().await.unwrap();
        assert_eq!(second.len(), 2);

        drop(rx);
        task.abort();
    }

    #[tokio::test]
    async fn stops_when_consumer_is_gone() {
        let fetcher = Arc::new(Scripted(Mutex::new(VecDeque::from(vec![Ok(vec![])]))));
        let task = tokio::spawn(run_reconciliation(
            fetcher,
            Duration::from_millis(5),
            |_| false,
        ));
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("reconciliation should stop")
            .unwrap();
    }

    #[cfg(feature = "roster-http")]
    mod http_fetcher {
        use super::*;
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::TcpListener;

        /// Serve one HTTP response on a local port; returns the base URL and
        /// a receiver for the raw request head.
        async fn serve_once(status: &'static str, body: &'static str) -> (String, tokio::sync::oneshot::Receiver<String>) {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let (req_tx, req_rx) = tokio::sync::oneshot::channel();

            tokio::spawn(async move {
                let (mut socket, _) = listener.accept().await.unwrap();
                let mut buf = vec![0u8; 4096];
                let n = socket.read(&mut buf).await.unwrap();
                let _ = req_tx.send(String::from_utf8_lossy(&buf[..n]).into_owned());
                let response = format!(
                    "HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                socket.write_all(response.as_bytes()).await.unwrap();
                socket.shutdown().await.unwrap();
            });

            (format!("http://{addr}"), req_rx)
        }

        #[tokio::test]
        async fn fetches_roster_from_players_endpoint() {
            let (base, request) =
                serve_once("200 OK", r#"[{"name":"Alice","hp":100},{"name":"Bob","hp":80}]"#).await;
            let fetcher = HttpRosterFetcher::new(&format!("{base}/"), Duration::from_secs(2)).unwrap();
            assert!(fetcher.url().ends_with("/api/players"));
            assert!(!fetcher.url().contains("//api"));

            let players = fetcher.fetch().await.unwrap();

            assert_eq!(
                players,
                vec![RosterEntry::new("Alice", 100), RosterEntry::new("Bob", 80)]
            );
            assert!(request.await.unwrap().starts_with("GET /api/players "));
        }

        #[tokio::test]
        async fn malformed_body_is_an_error() {
            let (base, _request) = serve_once("200 OK", r#"{"oops":true}"#).await;
            let fetcher = HttpRosterFetcher::new(&base, Duration::from_secs(2)).unwrap();
            let err = fetcher.fetch().await.unwrap_err();
            assert!(matches!(err, FaceshotError::RosterFetch(_)));
        }

        #[tokio::test]
        async fn error_status_is_an_error() {
            let (base, _request) = serve_once("503 Service Unavailable", "[]").await;
            let fetcher = HttpRosterFetcher::new(&base, Duration::from_secs(2)).unwrap();
            let err = fetcher.fetch().await.unwrap_err();
            assert!(matches!(err, FaceshotError::RosterFetch(_)));
        }
    }
}
