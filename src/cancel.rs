//! Cancellation tokens and per-request deadlines.
//!
//! Every request carries one [`CancelToken`] and one [`Deadline`]. The token
//! trips on client disconnect; the deadline trips on elapsed time. Both are
//! checked at every suspension point (cache, LLM, database, stream send) so
//! in-flight work unwinds within one I/O quantum.

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

/// Hands out [`CancelToken`]s and trips them all at once.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

/// Cheap cloneable cancellation observer.
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelHandle {
    pub fn new() -> (CancelHandle, CancelToken) {
        let (tx, rx) = watch::channel(false);
        (CancelHandle { tx }, CancelToken { rx })
    }

    /// Trip every token derived from this handle. Idempotent.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

impl CancelToken {
    /// A token that never trips, for contexts with no client to lose.
    pub fn detached() -> CancelToken {
        static DETACHED: std::sync::OnceLock<(watch::Sender<bool>, watch::Receiver<bool>)> =
            std::sync::OnceLock::new();
        let (_tx, rx) = DETACHED.get_or_init(|| watch::channel(false));
        CancelToken { rx: rx.clone() }
    }

    pub fn is_canceled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves when the token trips. If the handle is dropped without
    /// cancelling, this never resolves.
    pub async fn canceled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                // Handle gone without a cancel: park forever.
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Absolute per-request deadline.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Instant,
}

impl Deadline {
    pub fn after(d: Duration) -> Deadline {
        Deadline {
            at: Instant::now() + d,
        }
    }

    pub fn instant(&self) -> Instant {
        self.at
    }

    pub fn expired(&self) -> bool {
        Instant::now() >= self.at
    }

    /// Time left, zero when already past.
    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    /// The lesser of `d` and the time remaining, for bounding inner
    /// timeouts (LLM call, statement timeout) by the outer deadline.
    pub fn bound(&self, d: Duration) -> Duration {
        d.min(self.remaining())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn token_trips_on_cancel() {
        let (handle, token) = CancelHandle::new();
        assert!(!token.is_canceled());
        handle.cancel();
        assert!(token.is_canceled());
        token.canceled().await; // must resolve immediately
    }

    #[tokio::test]
    async fn detached_token_never_trips() {
        let token = CancelToken::detached();
        assert!(!token.is_canceled());
        let raced = tokio::time::timeout(Duration::from_millis(20), token.canceled()).await;
        assert!(raced.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_bounds_inner_timeouts() {
        let deadline = Deadline::after(Duration::from_secs(5));
        assert!(deadline.bound(Duration::from_secs(30)) <= Duration::from_secs(5));
        assert_eq!(
            deadline.bound(Duration::from_secs(1)),
            Duration::from_secs(1)
        );
        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(deadline.expired());
        assert_eq!(deadline.remaining(), Duration::ZERO);
    }
}
