//! Bounded retry with capped exponential backoff for remote calls.
//!
//! Every attempt runs under the per-call timeout; a timeout counts as a
//! transient failure. Codes that cannot succeed on resend are returned
//! immediately as [`RemoteError::Rejected`].

use std::future::Future;
use std::time::Duration;

use vrift_config::{log_remote_debug, log_remote_warn, RemoteConfig};

use crate::error::{RemoteError, Result};
use crate::provider::{Code, Status};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Deadline for each individual attempt
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RemoteConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RemoteConfig) -> Self {
        Self {
            retries: config.retries,
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            timeout: Duration::from_millis(config.request_timeout_ms),
        }
    }

    /// Delay before retry number `attempt` (0-based): doubles each time, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// Run `f` until it succeeds, fails permanently, or the budget is spent.
    ///
    /// `f` is called afresh for every attempt so each one sends the same
    /// request again.
    pub async fn run<T, F, Fut>(&self, op: &'static str, f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, Status>>,
    {
        self.drive(op, Some(self.timeout), f).await
    }

    /// Like [`run`](Self::run), without a deadline on the attempt as a whole.
    ///
    /// For streamed calls, whose every chunk is held to the per-call timeout
    /// instead. A failure anywhere in the stream restarts it from the start.
    pub async fn run_streaming<T, F, Fut>(&self, op: &'static str, f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, Status>>,
    {
        self.drive(op, None, f).await
    }

    async fn drive<T, F, Fut>(&self, op: &'static str, deadline: Option<Duration>, mut f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, Status>>,
    {
        let mut attempt = 0u32;
        loop {
            let outcome = match deadline {
                Some(limit) => tokio::time::timeout(limit, f())
                    .await
                    .unwrap_or_else(|_| Err(deadline_exceeded(limit))),
                None => f().await,
            };
            let status = match outcome {
                Ok(value) => return Ok(value),
                Err(status) => status,
            };

            if !status.code.is_retryable() {
                log_remote_debug!("Request rejected", op = op, status = status);
                return Err(RemoteError::Rejected { op, status });
            }
            if attempt >= self.retries {
                log_remote_warn!(
                    "Retries exhausted",
                    op = op,
                    attempts = attempt + 1,
                    status = status
                );
                return Err(RemoteError::Unavailable {
                    op,
                    attempts: attempt + 1,
                    last: status,
                });
            }

            let delay = self.backoff(attempt);
            log_remote_warn!(
                "Transient failure, retrying",
                op = op,
                attempt = attempt + 1,
                max_retries = self.retries,
                delay_ms = delay.as_millis(),
                status = status
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

/// The status a call that outlived its timeout fails with.
pub(crate) fn deadline_exceeded(timeout: Duration) -> Status {
    Status::new(
        Code::DeadlineExceeded,
        format!("no response within {:?}", timeout),
    )
}
