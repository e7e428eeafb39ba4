use crate::error::{Error, Result};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Bounded exponential backoff around connection acquisition.
///
/// Attempt `n` (0-based) that fails with a retryable error is followed by a
/// sleep of `min(base_delay * 2^n, max_delay)` plus up to `jitter` of that
/// delay at random. Fatal errors are returned at once.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, the first one included
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Extra random delay as a fraction of the backoff, 0.0 disables it
    pub jitter: f64,
    /// Treat acquire timeouts as retryable
    pub retry_on_timeout: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(2),
            jitter: 0.25,
            retry_on_timeout: false,
        }
    }
}

impl RetryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// A policy that makes exactly one attempt.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = n.max(1);
        self
    }

    pub fn with_base_delay(mut self, d: Duration) -> Self {
        self.base_delay = d;
        self
    }

    pub fn with_max_delay(mut self, d: Duration) -> Self {
        self.max_delay = d;
        self
    }

    pub fn with_jitter(mut self, ratio: f64) -> Self {
        self.jitter = ratio.clamp(0.0, 1.0);
        self
    }

    pub fn with_retry_on_timeout(mut self, retry: bool) -> Self {
        self.retry_on_timeout = retry;
        self
    }

    /// Delay after failed attempt `attempt`, before jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        2u32.checked_pow(attempt)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .map(|d| d.min(self.max_delay))
            .unwrap_or(self.max_delay)
    }

    /// `backoff(attempt)` plus a uniform random share of it, never less.
    pub fn delay(&self, attempt: u32) -> Duration {
        let backoff = self.backoff(attempt);
        // the field is public, so it may hold anything a struct literal allows
        let ratio = if self.jitter.is_nan() {
            0.0
        } else {
            self.jitter.clamp(0.0, 1.0)
        };
        let spread = backoff.mul_f64(ratio);
        if spread.is_zero() {
            return backoff;
        }
        let extra = rand::thread_rng().gen_range(0..=spread.as_micros() as u64);
        backoff + Duration::from_micros(extra)
    }

    fn should_retry(&self, e: &Error) -> bool {
        e.is_retryable() || (self.retry_on_timeout && e.is_timeout())
    }

    /// Runs `op` until it succeeds, fails fatally, or attempts run out.
    /// `op` receives the 0-based attempt number.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            let e = match op(attempt).await {
                Ok(v) => return Ok(v),
                Err(e) => e,
            };
            if !self.should_retry(&e) {
                return Err(e);
            }
            attempt += 1;
            if attempt >= self.max_attempts {
                return Err(Error::RetriesExhausted {
                    attempts: attempt,
                    source: Box::new(e),
                });
            }
            let delay = self.delay(attempt - 1);
            warn!(error = %e, attempt, max_attempts = self.max_attempts, ?delay, "acquire failed, retrying");
            tokio::time::sleep(delay).await;
        }
    }
}
