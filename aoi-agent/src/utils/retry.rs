//! Retry policy with an explicit backoff schedule
//!
//! The Nth retry sleeps for `delays[N-1]`; if attempts outlast the schedule the
//! last delay repeats. Sleeping goes through the [`Sleeper`] seam so tests can
//! record delays instead of waiting for them.

use async_trait::async_trait;
use std::fmt::Display;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Source of delays between attempts
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Real sleeping on the tokio timer
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Records requested delays and returns immediately
#[derive(Debug, Clone, Default)]
pub struct RecordingSleeper {
    delays: Arc<Mutex<Vec<Duration>>>,
}

impl RecordingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays requested so far, in order
    pub fn recorded(&self) -> Vec<Duration> {
        match self.delays.lock() {
            Ok(delays) => delays.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        match self.delays.lock() {
            Ok(mut delays) => delays.push(duration),
            Err(poisoned) => poisoned.into_inner().push(duration),
        }
    }
}

/// Outcome of a failed retried operation
#[derive(Debug)]
pub enum RetryError<E> {
    /// Non-retryable error, surfaced on the attempt that produced it
    Fatal(E),
    /// Every attempt failed with a retryable error
    Exhausted { attempts: u32, last: E },
}

/// Attempt count plus backoff schedule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    delays: Vec<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(
            3,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
            ],
        )
    }
}

impl RetryPolicy {
    /// `max_attempts` counts the first call; it is raised to at least 1
    pub fn new(max_attempts: u32, delays: Vec<Duration>) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delays,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn delays(&self) -> &[Duration] {
        &self.delays
    }

    /// Delay before retry number `retry` (1-based)
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let index = retry.saturating_sub(1) as usize;
        self.delays
            .get(index)
            .or_else(|| self.delays.last())
            .copied()
            .unwrap_or(Duration::ZERO)
    }

    /// Run `operation` until it succeeds, fails fatally, or attempts run out
    ///
    /// `operation` receives the 1-based attempt number. Errors for which
    /// `is_retryable` returns false are surfaced immediately without sleeping.
    pub async fn run<T, E, F, Fut, P>(
        &self,
        operation_name: &str,
        sleeper: &dyn Sleeper,
        is_retryable: P,
        mut operation: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        E: Display,
    {
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            if attempt > 1 {
                tracing::debug!(operation = operation_name, attempt, "Retrying operation");
            }

            match operation(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::info!(
                            operation = operation_name,
                            attempt,
                            "Operation succeeded after retry"
                        );
                    }
                    return Ok(value);
                }
                Err(err) => {
                    if !is_retryable(&err) {
                        tracing::debug!(
                            operation = operation_name,
                            attempt,
                            error = %err,
                            "Non-retryable failure"
                        );
                        return Err(RetryError::Fatal(err));
                    }

                    if attempt >= self.max_attempts {
                        tracing::error!(
                            operation = operation_name,
                            attempts = attempt,
                            error = %err,
                            "Operation failed: retry attempts exhausted"
                        );
                        return Err(RetryError::Exhausted {
                            attempts: attempt,
                            last: err,
                        });
                    }

                    let delay = self.delay_for_retry(attempt);
                    tracing::warn!(
                        operation = operation_name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Transient failure, will retry after backoff"
                    );
                    sleeper.sleep(delay).await;
                }
            }
        }
    }
}
