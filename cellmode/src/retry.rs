//! Retry with delay and multiplicative backoff.
//!
//! The caller decides which errors are worth another attempt. Errors for which
//! the predicate returns `false` are returned immediately, and once the attempt
//! budget is spent the last error is returned unchanged.

use bon::Builder;
use std::{thread, time::Duration};
use tokio::time;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Builder)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one.
    #[builder(default = 3)]
    pub max_attempts: u32,
    /// Delay before the second attempt.
    #[builder(default = Duration::from_secs(1))]
    pub delay: Duration,
    /// Factor the delay is multiplied by after every failed attempt.
    #[builder(default = 1.0)]
    pub backoff: f64,
    /// Upper bound for a single delay.
    pub max_delay: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl RetryPolicy {
    /// Five attempts starting at one second, doubling, capped at a minute.
    pub fn exponential() -> Self {
        Self::builder()
            .max_attempts(5)
            .delay(Duration::from_secs(1))
            .backoff(2.0)
            .max_delay(Duration::from_secs(60))
            .build()
    }

    /// Runs `op` until it succeeds, `should_retry` rejects its error, or the
    /// attempt budget is spent. Blocks the calling thread between attempts.
    pub fn retry<T, E, F, P>(&self, mut should_retry: P, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Result<T, E>,
        P: FnMut(&E) -> bool,
        E: std::fmt::Display,
    {
        let attempts = self.max_attempts.max(1);
        let mut delay = self.delay;
        let mut attempt = 1;

        loop {
            match op() {
                Ok(v) => return Ok(v),
                Err(e) if !should_retry(&e) => {
                    debug!("not retrying after attempt {attempt}: {e}");
                    return Err(e);
                }
                Err(e) if attempt >= attempts => {
                    warn!("all {attempts} attempts failed: {e}");
                    return Err(e);
                }
                Err(e) => {
                    debug!("attempt {attempt}/{attempts} failed, retrying in {delay:?}: {e}");
                    thread::sleep(delay);
                    delay = self.next_delay(delay);
                    attempt += 1;
                }
            }
        }
    }

    /// [`Self::retry`] using [`crate::Error::is_retryable`] as the predicate.
    pub fn retry_retryable<T, F>(&self, op: F) -> crate::Result<T>
    where
        F: FnMut() -> crate::Result<T>,
    {
        self.retry(crate::Error::is_retryable, op)
    }

    /// Async flavour of [`Self::retry`]; sleeps on the tokio timer.
    pub async fn retry_async<T, E, F, P>(&self, mut should_retry: P, op: F) -> Result<T, E>
    where
        F: AsyncFn() -> Result<T, E>,
        P: FnMut(&E) -> bool,
        E: std::fmt::Display,
    {
        let attempts = self.max_attempts.max(1);
        let mut delay = self.delay;
        let mut attempt = 1;

        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if !should_retry(&e) => {
                    debug!("not retrying after attempt {attempt}: {e}");
                    return Err(e);
                }
                Err(e) if attempt >= attempts => {
                    warn!("all {attempts} attempts failed: {e}");
                    return Err(e);
                }
                Err(e) => {
                    debug!("attempt {attempt}/{attempts} failed, retrying in {delay:?}: {e}");
                    time::sleep(delay).await;
                    delay = self.next_delay(delay);
                    attempt += 1;
                }
            }
        }
    }

    fn next_delay(&self, current: Duration) -> Duration {
        let next = current.mul_f64(self.backoff.max(0.0));
        match self.max_delay {
            Some(max) => next.min(max),
            None => next,
        }
    }
}
