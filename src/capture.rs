//! Bounded-retry signature capture.
//!
//! The camera and face model live behind [`SignatureExtractor`]. [`capture`]
//! invokes it until a usable face is detected or the [`CapturePolicy`] runs
//! out of attempts. Waiting between attempts goes through a [`Sleeper`] so the
//! retry schedule can be tested without real timers.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, trace, warn};

use crate::error::{FaceshotError, Result};
use crate::protocol::Signature;

/// Bounding box of a detected face, in frame pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FaceRegion {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

/// One successful face detection.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    /// Descriptor sent to the arbiter.
    pub signature: Signature,
    /// Where the face was found, for debug overlays.
    pub region: Option<FaceRegion>,
}

impl Detection {
    /// Detection without region information.
    pub fn new(signature: Signature) -> Self {
        Self {
            signature,
            region: None,
        }
    }

    #[must_use]
    pub fn with_region(mut self, region: FaceRegion) -> Self {
        self.region = Some(region);
        self
    }
}

/// Produces a facial signature from the current camera frame.
///
/// Reads of the camera are non-destructive, so implementations take `&self`
/// and may be shared between concurrent captures.
#[async_trait]
pub trait SignatureExtractor: Send + Sync + 'static {
    /// Analyze the current frame.
    ///
    /// Returns `Ok(None)` when no face is visible.
    ///
    /// # Errors
    ///
    /// Transient failures (model hiccups, frame not ready) are reported as
    /// errors and retried by [`capture`] like a missing face.
    async fn extract(&self) -> Result<Option<Detection>>;
}

/// Waits between capture attempts.
#[async_trait]
pub trait Sleeper: Send + Sync + 'static {
    async fn sleep(&self, duration: Duration);
}

/// [`Sleeper`] backed by `tokio::time::sleep`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Retry budget for one capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapturePolicy {
    /// Total extractor invocations allowed. Always at least 1.
    pub max_attempts: u32,
    /// Pause after each failed attempt except the last.
    pub retry_delay: Duration,
}

impl CapturePolicy {
    /// Create a policy. `max_attempts` below 1 is clamped to 1.
    pub fn new(max_attempts: u32, retry_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            retry_delay,
        }
    }

    /// A single attempt with no retry.
    pub fn single() -> Self {
        Self::new(1, Duration::ZERO)
    }
}

/// Capture a signature, retrying on missing or failed detections.
///
/// # Errors
///
/// Returns [`FaceshotError::FaceNotFound`] once `policy.max_attempts`
/// invocations have all failed. This is an expected outcome (the player
/// looked away), not a fault.
pub async fn capture(
    extractor: &dyn SignatureExtractor,
    sleeper: &dyn Sleeper,
    policy: CapturePolicy,
) -> Result<Detection> {
    let attempts = policy.max_attempts.max(1);

    for attempt in 1..=attempts {
        match extractor.extract().await {
            Ok(Some(detection)) if detection.signature.is_well_formed() => {
                debug!(
                    attempt,
                    len = detection.signature.len(),
                    region = ?detection.region,
                    "face detected"
                );
                return Ok(detection);
            }
            Ok(Some(detection)) => {
                warn!(
                    attempt,
                    len = detection.signature.len(),
                    "extractor produced a malformed signature"
                );
            }
            Ok(None) => trace!(attempt, "no face in frame"),
            Err(e) => debug!(attempt, error = %e, "extractor failed"),
        }

        if attempt < attempts {
            sleeper.sleep(policy.retry_delay).await;
        }
    }

    Err(FaceshotError::FaceNotFound { attempts })
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
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Replays scripted results; falls back to "no face" when exhausted.
    struct Scripted {
        script: Mutex<VecDeque<Result<Option<Detection>>>>,
        calls: AtomicU32,
    }

    impl Scripted {
        fn new(script: Vec<Result<Option<Detection>>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl SignatureExtractor for Scripted {
        async fn extract(&self) -> Result<Option<Detection>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.script.lock().unwrap().pop_front().unwrap_or(Ok(None))
        }
    }

    #[derive(Default)]
    struct Recording(Mutex<Vec<Duration>>);

    #[async_trait]
    impl Sleeper for Recording {
        async fn sleep(&self, duration: Duration) {
            self.0.lock().unwrap().push(duration);
        }
    }

    fn face(values: Vec<f32>) -> Detection {
        Detection::new(Signature::new(values))
    }

    #[tokio::test]
    async fn returns_first_detection_without_sleeping() {
        let extractor = Scripted::new(vec![Ok(Some(face(vec![0.1, 0.2])))]);
        let sleeper = Recording::default();

        let detection = capture(&extractor, &sleeper, CapturePolicy::new(5, Duration::from_millis(300)))
            .await
            .unwrap();

        assert_eq!(detection.signature.as_slice(), &[0.1, 0.2]);
        assert_eq!(extractor.calls.load(Ordering::SeqCst), 1);
        assert!(sleeper.0.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn exhausting_budget_makes_exactly_n_attempts() {
        for n in 1..=6 {
            let extractor = Scripted::new(vec![]);
            let sleeper = Recording::default();
            let delay = Duration::from_millis(300);

            let err = capture(&extractor, &sleeper, CapturePolicy::new(n, delay))
                .await
                .unwrap_err();

            assert!(matches!(err, FaceshotError::FaceNotFound { attempts } if attempts == n));
            assert_eq!(extractor.calls.load(Ordering::SeqCst), n);
            let sleeps = sleeper.0.lock().unwrap();
            assert_eq!(sleeps.len() as u32, n - 1);
            assert!(sleeps.iter().all(|d| *d == delay));
        }
    }

    #[tokio::test]
    async fn extractor_errors_and_malformed_signatures_are_retried() {
        let extractor = Scripted::new(vec![
            Err(FaceshotError::Extractor("frame not ready".into())),
            Ok(Some(face(vec![f32::NAN, 1.0]))),
            Ok(None),
            Ok(Some(face(vec![0.5]).with_region(FaceRegion {
                x: 10.0,
                y: 20.0,
                width: 64.0,
                height: 64.0,
            }))),
        ]);
        let sleeper = Recording::default();

        let detection = capture(&extractor, &sleeper, CapturePolicy::new(10, Duration::from_millis(1)))
            .await
            .unwrap();

        assert_eq!(extractor.calls.load(Ordering::SeqCst), 4);
        assert_eq!(sleeper.0.lock().unwrap().len(), 3);
        assert_eq!(detection.region.map(|r| r.width), Some(64.0));
    }

    #[test]
    fn zero_attempts_is_clamped_to_one() {
        assert_eq!(CapturePolicy::new(0, Duration::ZERO).max_attempts, 1);
        assert_eq!(CapturePolicy::single().max_attempts, 1);
    }
}
