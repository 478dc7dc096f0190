use std::future::Future;
use std::time::Duration;

use tracing::warn;

use common::{Error, ExecutionParams, Result};

/// Timeout plus capped exponential backoff around broker calls.
///
/// Only connectivity errors (`Error::is_retryable`) are retried. A rejection
/// or any other error is returned immediately.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    timeout: Duration,
    max_attempts: u32,
    base_backoff: Duration,
    max_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(
        timeout: Duration,
        max_attempts: u32,
        base_backoff: Duration,
        max_backoff: Duration,
    ) -> Self {
        Self {
            timeout,
            max_attempts: max_attempts.max(1),
            base_backoff,
            max_backoff,
        }
    }

    pub fn from_params(params: &ExecutionParams) -> Self {
        Self::new(
            params.broker_timeout(),
            params.max_attempts,
            Duration::from_millis(params.base_backoff_ms),
            Duration::from_millis(params.max_backoff_ms),
        )
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before attempt `attempt + 1`, with `attempt` starting at 1.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let mut backoff = self.base_backoff;
        for _ in 1..attempt {
            backoff = (backoff * 2).min(self.max_backoff);
        }
        backoff.min(self.max_backoff)
    }

    /// Run one call under the timeout. An elapsed timeout becomes `Error::Timeout`.
    pub async fn attempt<T>(&self, op: &str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(format!(
                "{op} did not answer within {:?}",
                self.timeout
            ))),
        }
    }

    /// Run `f` until it succeeds, fails with a non-retryable error, or the
    /// attempt budget is spent. Returns the last error on exhaustion.
    pub async fn call<T, F, Fut>(&self, op: &str, mut f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match self.attempt(op, f()).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    let backoff = self.backoff(attempt);
                    warn!(op, attempt, error = %e, backoff = ?backoff, "Broker call failed, retrying");
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
