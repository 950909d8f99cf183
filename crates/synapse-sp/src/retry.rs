//! Bounded retry and polling with backoff
//!
//! Two loops cover every provider interaction that may need more than one
//! round trip:
//! - [`retry_if`] repeats a request while its error is classified as
//!   transient, up to a retry budget and an overall deadline.
//! - [`poll_until`] repeats a status query until it reports a terminal
//!   state, up to an overall deadline.
//!
//! Neither loop runs forever: exceeding `timeout` yields `SpError::Timeout`.

use crate::{Result, SpError};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Retry/backoff configuration
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Maximum retries after the first attempt (`None` retries until the deadline)
    pub max_retries: Option<u32>,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Upper bound for a single delay
    pub max_delay: Duration,
    /// Multiplicative factor applied per attempt
    pub backoff_factor: f64,
    /// Overall deadline across all attempts
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: Some(3),
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            backoff_factor: 2.0,
            timeout: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Fixed-interval polling bounded only by `timeout`
    pub fn polling(interval: Duration, timeout: Duration) -> Self {
        Self {
            max_retries: None,
            initial_delay: interval,
            max_delay: interval,
            backoff_factor: 1.0,
            timeout,
        }
    }

    /// No retries at all
    pub fn none() -> Self {
        Self {
            max_retries: Some(0),
            ..Default::default()
        }
    }

    /// Set the retry budget
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Set the overall deadline
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the backoff factor
    pub fn with_backoff(mut self, initial_delay: Duration, factor: f64, max_delay: Duration) -> Self {
        self.initial_delay = initial_delay;
        self.backoff_factor = factor;
        self.max_delay = max_delay;
        self
    }

    /// Delay before retry number `attempt` (1-indexed), clamped to `max_delay`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base = self.initial_delay.as_nanos() as f64 * self.backoff_factor.powi(exponent);
        let max = self.max_delay.as_nanos() as f64;
        let clamped = if base.is_nan() || base < 0.0 {
            0.0
        } else {
            base.min(max)
        };
        Duration::from_nanos(clamped as u64)
    }

    fn budget_exhausted(&self, retries_done: u32) -> bool {
        matches!(self.max_retries, Some(max) if retries_done >= max)
    }
}

/// Sleep for `delay`, returning early with `Aborted` if `cancel` fires
pub async fn sleep_or_cancel(delay: Duration, cancel: Option<&CancellationToken>) -> Result<()> {
    match cancel {
        Some(token) => tokio::select! {
            _ = token.cancelled() => Err(SpError::Aborted),
            _ = tokio::time::sleep(delay) => Ok(()),
        },
        None => {
            tokio::time::sleep(delay).await;
            Ok(())
        }
    }
}

/// Run `op`, retrying while `should_retry` accepts the error
pub async fn retry_if<T, F, Fut, P>(
    policy: &RetryPolicy,
    operation: &str,
    should_retry: P,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    P: Fn(&SpError) -> bool,
{
    let start = Instant::now();
    let mut retries = 0u32;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if !should_retry(&err) || policy.budget_exhausted(retries) {
                    return Err(err);
                }
                retries += 1;
                let delay = policy.delay_for(retries);
                if start.elapsed() + delay > policy.timeout {
                    return Err(SpError::Timeout {
                        operation: operation.to_string(),
                        seconds: policy.timeout.as_secs(),
                    });
                }
                debug!(operation, retries, ?delay, error = %err, "retrying");
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Run `op`, retrying transient transport errors
pub async fn retry<T, F, Fut>(policy: &RetryPolicy, operation: &str, op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    retry_if(policy, operation, SpError::is_retryable, op).await
}

/// Poll `op` until it yields `Some`, tolerating transient errors
pub async fn poll_until<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    cancel: Option<&CancellationToken>,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    let start = Instant::now();
    let mut attempt = 0u32;

    loop {
        if cancel.is_some_and(|c| c.is_cancelled()) {
            return Err(SpError::Aborted);
        }

        match op().await {
            Ok(Some(value)) => return Ok(value),
            Ok(None) => {}
            Err(err) if err.is_retryable() => {
                warn!(operation, error = %err, "transient error while polling");
            }
            Err(err) => return Err(err),
        }

        attempt += 1;
        if policy.budget_exhausted(attempt) {
            return Err(SpError::Timeout {
                operation: operation.to_string(),
                seconds: start.elapsed().as_secs(),
            });
        }
        let delay = policy.delay_for(attempt);
        if start.elapsed() + delay > policy.timeout {
            return Err(SpError::Timeout {
                operation: operation.to_string(),
                seconds: policy.timeout.as_secs(),
            });
        }
        sleep_or_cancel(delay, cancel).await?;
    }
}
