//! Page-state detectors.
//!
//! Each detector is a side-effect-free (modulo page reads) predicate over the
//! live page, produced fresh on every call. Nothing here is cached across
//! navigations — page identity can change underneath the caller at any time.

pub mod captcha;
pub mod chat;
pub mod login;

pub use captcha::CaptchaDetector;
pub use chat::{ChatOpener, ChatProbeKind, ChatProbeOutcome};
pub use login::LoginDetector;

use std::time::{Duration, Instant};

/// Boolean verdict plus the reason/selector trail that produced it.
#[derive(Debug, Clone)]
pub struct Verdict {
    pub hit: bool,
    pub reason: String,
}

impl Verdict {
    pub fn hit(reason: impl Into<String>) -> Self {
        Self {
            hit: true,
            reason: reason.into(),
        }
    }

    pub fn miss(reason: impl Into<String>) -> Self {
        Self {
            hit: false,
            reason: reason.into(),
        }
    }
}

/// How a polled wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Satisfied,
    /// Deadline elapsed with the condition still unmet. For captcha waits
    /// this is the recoverable "still blocked" signal.
    TimedOut,
    PageClosed,
    Cancelled,
}

/// The polling primitive every wait is built on: fixed interval, optional
/// deadline (`None` = unbounded, which only the login wait uses).
#[derive(Debug)]
pub struct PollLoop {
    interval: Duration,
    deadline: Option<Instant>,
}

impl PollLoop {
    pub fn new(interval: Duration, limit: Option<Duration>) -> Self {
        // A limit too large to land on the clock is the same as no limit.
        Self {
            interval,
            deadline: limit.and_then(|d| Instant::now().checked_add(d)),
        }
    }

    pub fn unbounded(interval: Duration) -> Self {
        Self::new(interval, None)
    }

    pub fn expired(&self) -> bool {
        self.deadline.map(|d| Instant::now() >= d).unwrap_or(false)
    }

    pub async fn tick(&self) {
        tokio::time::sleep(self.interval).await;
    }
}

/// Probe failures are expected while checks race page loads; they mean
/// "no signal", never an error.
pub(crate) fn tolerate<T: Default>(result: anyhow::Result<T>, probe: &str) -> T {
    match result {
        Ok(v) => v,
        Err(e) => {
            tracing::debug!("{} probe failed (tolerated): {}", probe, e);
            T::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unbounded_poll_never_expires() {
        let poll = PollLoop::unbounded(Duration::from_millis(10));
        assert!(!poll.expired());
    }

    #[test]
    fn absurd_limit_behaves_like_no_limit() {
        let poll = PollLoop::new(Duration::from_millis(10), Some(Duration::from_secs(u64::MAX)));
        assert!(!poll.expired());
    }

    #[test]
    fn zero_limit_expires_immediately() {
        let poll = PollLoop::new(Duration::from_millis(10), Some(Duration::ZERO));
        assert!(poll.expired());
    }

    #[test]
    fn tolerate_maps_errors_to_default() {
        let ok: Vec<String> = tolerate(Ok(vec!["a".to_string()]), "test");
        assert_eq!(ok.len(), 1);
        let failed: Vec<String> = tolerate(Err(anyhow::anyhow!("boom")), "test");
        assert!(failed.is_empty());
    }
}
