//! Back-off policy for block source calls.

use std::{future::Future, time::Duration};

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::{IndexerError, IndexerResult};

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the initial attempt.
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
            backoff_factor: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Policy for loops that retry forever, e.g. catch-up and re-subscription.
    pub fn unbounded() -> Self {
        Self {
            max_retries: u32::MAX,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt`, counting from 0.
    ///
    /// Grows by `backoff_factor` per attempt up to `max_delay`. With jitter
    /// the delay is drawn from the upper half of that ceiling.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let growth = self.backoff_factor.max(1.0).powi(attempt.min(64) as i32);
        let ceiling = Duration::try_from_secs_f64(self.initial_delay.as_secs_f64() * growth)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay));
        if !self.jitter {
            return ceiling;
        }
        let ceiling_ms = ceiling.as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(ceiling_ms / 2..=ceiling_ms))
    }

    /// Runs `op` until it succeeds, fails with a non-transient error or runs out of retries.
    pub async fn retry<T, F, Fut>(&self, what: &str, mut op: F) -> IndexerResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = IndexerResult<T>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < self.max_retries => {
                    let delay = self.delay_for_attempt(attempt);
                    warn!(
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        "{what} failed, retrying: {err}"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Like [`RetryConfig::retry`], but a `NotFound` answer is an absent value
    /// and ends the loop at once.
    pub async fn retry_optional<T, F, Fut>(&self, what: &str, mut op: F) -> IndexerResult<Option<T>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = IndexerResult<T>>,
    {
        self.retry(what, || {
            let attempt = op();
            async move {
                match attempt.await {
                    Err(IndexerError::NotFound(_)) => Ok(None),
                    other => other.map(Some),
                }
            }
        })
        .await
    }
}

/// Sleeps for `duration` unless cancelled first. Returns false on cancellation.
pub async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

/// Statuses worth retrying.
pub fn is_retryable_status(status: reqwest::StatusCode) -> bool {
    status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS
}

pub(crate) fn status_error(what: &str, status: reqwest::StatusCode) -> IndexerError {
    if status == reqwest::StatusCode::NOT_FOUND {
        IndexerError::NotFound(what.to_string())
    } else if is_retryable_status(status) {
        IndexerError::Source(format!("{what}: {status}"))
    } else {
        IndexerError::malformed(format!("{what}: rejected with {status}"))
    }
}
