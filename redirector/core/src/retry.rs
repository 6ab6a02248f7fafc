use std::{fmt, future::Future};
use tokio::time;
use tracing::{debug, info};

/// A bounded, doubling backoff.
///
/// An operation is attempted once and then retried at most `retries` more times. The first
/// retry waits `initial` and each subsequent wait doubles. No jitter is applied.
///
/// A `Backoff` holds no per-call state, so the same value may drive any number of concurrent
/// operations.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Backoff {
    retries: u32,
    initial: time::Duration,
}

// === impl Backoff ===

impl Default for Backoff {
    /// Four retries waiting 1s, 2s, 4s, and 8s.
    fn default() -> Self {
        Self::new(4, time::Duration::from_secs(1))
    }
}

impl Backoff {
    pub const fn new(retries: u32, initial: time::Duration) -> Self {
        Self { retries, initial }
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// The delays slept before each retry, in order.
    pub fn delays(&self) -> impl Iterator<Item = time::Duration> {
        let initial = self.initial;
        (0..self.retries).map(move |n| initial.saturating_mul(2u32.saturating_pow(n)))
    }

    /// Runs `f` until it succeeds or the retry budget is spent, returning the last error.
    pub async fn retry<T, E, F, Fut>(&self, op: &str, f: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        self.retry_if(op, f, |_| true).await
    }

    /// Like [`Backoff::retry`], but errors for which `retryable` returns false are returned
    /// immediately.
    pub async fn retry_if<T, E, F, Fut, P>(
        &self,
        op: &str,
        mut f: F,
        mut retryable: P,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: FnMut(&E) -> bool,
        E: fmt::Display,
    {
        let mut delays = self.delays();
        let mut attempt = 1;
        loop {
            let error = match f().await {
                Ok(value) => {
                    debug!(op, attempt, "Succeeded");
                    return Ok(value);
                }
                Err(error) => error,
            };

            if !retryable(&error) {
                return Err(error);
            }

            let Some(delay) = delays.next() else {
                info!(op, attempts = attempt, %error, "Giving up");
                return Err(error);
            };
            info!(op, attempt, %error, ?delay, "Failed; retrying");
            time::sleep(delay).await;
            attempt += 1;
        }
    }
}
