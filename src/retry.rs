//! Bounded exponential backoff with jitter and cancellation.
//!
//! Wraps a fallible async stage (in practice the LLM call) with up to
//! `max_attempts` tries. The delay before attempt `i+1` is
//! `min(max_delay, base_delay · exponential_base^(i-1))`, multiplied by a
//! uniform factor in `[0.5, 1.5]` when jitter is on. A non-retriable error
//! aborts immediately; the enclosing deadline and cancel token are observed
//! both during attempts and between them.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::cancel::{CancelToken, Deadline};

/// Errors that know whether another attempt could succeed.
pub trait Retriable {
    fn is_retriable(&self) -> bool;
}

impl Retriable for crate::error::LlmError {
    fn is_retriable(&self) -> bool {
        crate::error::LlmError::is_retriable(self)
    }
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts, including the first. Must be ≥ 1.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub exponential_base: f64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            exponential_base: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn with_max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = n.max(1);
        self
    }

    /// Backoff delay after 1-indexed attempt `i`.
    fn delay_after(&self, attempt: u32) -> Duration {
        let exp = self.exponential_base.powi(attempt.saturating_sub(1) as i32);
        let raw = self.base_delay.as_secs_f64() * exp;
        let capped = raw.min(self.max_delay.as_secs_f64());
        let factor = if self.jitter {
            rand::thread_rng().gen_range(0.5..1.5)
        } else {
            1.0
        };
        Duration::from_secs_f64(capped * factor)
    }
}

/// Why a retried stage ultimately failed.
#[derive(Debug)]
pub enum RetryError<E> {
    /// The last attempt's error, after exhaustion or a non-retriable failure.
    Inner(E),
    /// The enclosing deadline elapsed.
    Timeout,
    /// The request was canceled.
    Canceled,
}

/// Drive `op` with the configured retry policy. `op` is a factory invoked
/// once per attempt.
pub async fn run_with_retry<T, E, F, Fut>(
    config: &RetryConfig,
    deadline: Deadline,
    cancel: &CancelToken,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    E: Retriable,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut last_err: Option<E> = None;

    for attempt in 1..=config.max_attempts.max(1) {
        if cancel.is_canceled() {
            return Err(RetryError::Canceled);
        }
        if deadline.expired() {
            return Err(RetryError::Timeout);
        }

        let result = tokio::select! {
            r = op() => r,
            _ = cancel.canceled() => return Err(RetryError::Canceled),
            _ = tokio::time::sleep_until(deadline.instant()) => return Err(RetryError::Timeout),
        };

        match result {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_retriable() => return Err(RetryError::Inner(e)),
            Err(e) => {
                last_err = Some(e);
                if attempt == config.max_attempts {
                    break;
                }
                let delay = config.delay_after(attempt);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.canceled() => return Err(RetryError::Canceled),
                    _ = tokio::time::sleep_until(deadline.instant()) => {
                        return Err(RetryError::Timeout)
                    }
                }
            }
        }
    }

    match last_err {
        Some(e) => Err(RetryError::Inner(e)),
        // max_attempts == 0 is normalized to 1, so this is unreachable in
        // practice; treat it as a timeout rather than panic.
        None => Err(RetryError::Timeout),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[derive(Debug)]
    struct TestErr {
        retriable: bool,
    }

    impl Retriable for TestErr {
        fn is_retriable(&self) -> bool {
            self.retriable
        }
    }

    fn quick_config(attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts: attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            exponential_base: 2.0,
            jitter: false,
        }
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in = calls.clone();
        let result: Result<u32, _> = run_with_retry(
            &quick_config(3),
            Deadline::after(Duration::from_secs(5)),
            &CancelToken::detached(),
            move || {
                let calls = calls_in.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(TestErr { retriable: true })
                    } else {
                        Ok(7)
                    }
                }
            },
        )
        .await;
        assert!(matches!(result, Ok(7)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retriable_aborts_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in = calls.clone();
        let result: Result<u32, _> = run_with_retry(
            &quick_config(5),
            Deadline::after(Duration::from_secs(5)),
            &CancelToken::detached(),
            move || {
                let calls = calls_in.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<u32, _>(TestErr { retriable: false })
                }
            },
        )
        .await;
        assert!(matches!(result, Err(RetryError::Inner(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhaustion_returns_last_error() {
        let result: Result<u32, _> = run_with_retry(
            &quick_config(2),
            Deadline::after(Duration::from_secs(5)),
            &CancelToken::detached(),
            || async { Err::<u32, _>(TestErr { retriable: true }) },
        )
        .await;
        assert!(matches!(result, Err(RetryError::Inner(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_aborts_inflight_attempt() {
        let result: Result<u32, RetryError<TestErr>> = run_with_retry(
            &quick_config(3),
            Deadline::after(Duration::from_millis(50)),
            &CancelToken::detached(),
            || async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(1)
            },
        )
        .await;
        assert!(matches!(result, Err(RetryError::Timeout)));
    }

    #[tokio::test]
    async fn cancel_aborts_between_attempts() {
        let (handle, token) = crate::cancel::CancelHandle::new();
        handle.cancel();
        let result: Result<u32, _> = run_with_retry(
            &quick_config(3),
            Deadline::after(Duration::from_secs(5)),
            &token,
            || async { Err::<u32, _>(TestErr { retriable: true }) },
        )
        .await;
        assert!(matches!(result, Err(RetryError::Canceled)));
    }

    #[test]
    fn backoff_is_capped() {
        let config = RetryConfig {
            max_attempts: 10,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(4),
            exponential_base: 2.0,
            jitter: false,
        };
        assert_eq!(config.delay_after(1), Duration::from_secs(1));
        assert_eq!(config.delay_after(2), Duration::from_secs(2));
        assert_eq!(config.delay_after(3), Duration::from_secs(4));
        assert_eq!(config.delay_after(8), Duration::from_secs(4));
    }

    #[test]
    fn jitter_stays_in_band() {
        let config = RetryConfig {
            jitter: true,
            ..quick_config(3)
        };
        for _ in 0..100 {
            let d = config.delay_after(2);
            let nominal = Duration::from_millis(2).as_secs_f64();
            assert!(d.as_secs_f64() >= nominal * 0.5);
            assert!(d.as_secs_f64() <= nominal * 1.5);
        }
    }
}
