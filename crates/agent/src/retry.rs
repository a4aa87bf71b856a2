//! Retry with backoff
//!
//! Every coordinator call made by a worker goes through a [`Retrier`]. The
//! operation receives an [`Attempt`] and can call [`Attempt::break_retries`]
//! to stop retrying an error that will never succeed, such as a 422 from
//! the coordinator.
//!
//! ```ignore
//! let identity = Retrier::new("register", RetryPolicy::constant(Duration::from_secs(10), 30))
//!     .run(|attempt| async move {
//!         client.register(&request).await.map_err(|e| break_if_terminal(&attempt, e))
//!     })
//!     .await?;
//! ```

use std::fmt::Display;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use raibid_common::ApiError;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

/// How long to wait between attempts
#[derive(Debug, Clone, PartialEq)]
pub enum Backoff {
    /// Same delay every time
    Constant(Duration),
    /// `initial * multiplier^(retry - 1)`, optionally capped
    Exponential {
        initial: Duration,
        multiplier: f64,
        max: Option<Duration>,
    },
}

/// Retry configuration
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first
    pub max_attempts: u32,
    pub backoff: Backoff,
    /// Jitter factor (0.0-1.0); 0.1 means ±10% of the delay
    pub jitter: f64,
}

impl RetryPolicy {
    /// Fixed interval between attempts
    pub fn constant(interval: Duration, max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff: Backoff::Constant(interval),
            jitter: 0.0,
        }
    }

    /// Doubling delay starting at `initial`
    pub fn exponential(initial: Duration, max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff: Backoff::Exponential {
                initial,
                multiplier: 2.0,
                max: None,
            },
            jitter: 0.0,
        }
    }

    /// Set the maximum number of attempts
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Cap exponential delays
    pub fn with_max_interval(mut self, cap: Duration) -> Self {
        if let Backoff::Exponential { ref mut max, .. } = self.backoff {
            *max = Some(cap);
        }
        self
    }

    /// Set the jitter factor (0.0-1.0)
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before retry number `retry` (1 = the first retry), without jitter
    pub fn base_delay(&self, retry: u32) -> Duration {
        match &self.backoff {
            Backoff::Constant(interval) => *interval,
            Backoff::Exponential {
                initial,
                multiplier,
                max,
            } => {
                let exponent = retry.saturating_sub(1).min(63) as i32;
                let secs = initial.as_secs_f64() * multiplier.powi(exponent);
                let capped = match max {
                    Some(max) => secs.min(max.as_secs_f64()),
                    None => secs,
                };
                Duration::try_from_secs_f64(capped).unwrap_or(Duration::MAX)
            }
        }
    }

    /// Delay before retry number `retry`, with jitter applied
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let base = self.base_delay(retry);
        let range = base.as_secs_f64() * self.jitter;
        if range <= 0.0 {
            return base;
        }

        let offset = rand::thread_rng().gen_range(-range..range);
        let jittered = (base.as_secs_f64() + offset).max(0.0);
        Duration::try_from_secs_f64(jittered).unwrap_or(Duration::MAX)
    }
}

/// Handle given to each invocation of a retried operation
#[derive(Debug, Clone)]
pub struct Attempt {
    number: u32,
    broken: Arc<AtomicBool>,
}

impl Attempt {
    /// 1-based attempt number
    pub fn number(&self) -> u32 {
        self.number
    }

    /// Stop retrying; the error returned by this attempt is final
    pub fn break_retries(&self) {
        self.broken.store(true, Ordering::SeqCst);
    }
}

/// Break on coordinator rejections (400, 401, 404, 410, 422)
pub fn break_if_terminal(attempt: &Attempt, err: ApiError) -> ApiError {
    if err.is_terminal() {
        attempt.break_retries();
    }
    err
}

/// Outcome of a retried operation that did not succeed
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// The operation called `break_retries`
    #[error("{source}")]
    Aborted { attempts: u32, source: E },

    /// Every attempt failed
    #[error("gave up after {attempts} attempts: {source}")]
    Exhausted { attempts: u32, source: E },

    /// Cancelled while waiting to retry
    #[error("cancelled after {attempts} attempts")]
    Cancelled { attempts: u32, last: Option<E> },
}

impl<E> RetryError<E> {
    /// Number of times the operation ran
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Aborted { attempts, .. }
            | Self::Exhausted { attempts, .. }
            | Self::Cancelled { attempts, .. } => *attempts,
        }
    }

    /// Last error produced by the operation
    pub fn last_error(&self) -> Option<&E> {
        match self {
            Self::Aborted { source, .. } | Self::Exhausted { source, .. } => Some(source),
            Self::Cancelled { last, .. } => last.as_ref(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

/// Per-operation retry state
///
/// Created for one operation and consumed by [`Retrier::run`].
pub struct Retrier {
    operation: String,
    policy: RetryPolicy,
    attempts: u32,
    broken: Arc<AtomicBool>,
}

impl Retrier {
    pub fn new(operation: impl Into<String>, policy: RetryPolicy) -> Self {
        Self {
            operation: operation.into(),
            policy,
            attempts: 0,
            broken: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Run `op` until it succeeds, breaks, or runs out of attempts
    pub async fn run<T, E, F, Fut>(self, op: F) -> Result<T, RetryError<E>>
    where
        F: FnMut(Attempt) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        self.run_with_cancel(&CancellationToken::new(), op).await
    }

    /// Like [`Retrier::run`], but waiting between attempts ends early when
    /// `cancel` fires
    pub async fn run_with_cancel<T, E, F, Fut>(
        mut self,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut(Attempt) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let started = Instant::now();

        loop {
            if cancel.is_cancelled() && self.attempts == 0 {
                return Err(RetryError::Cancelled {
                    attempts: 0,
                    last: None,
                });
            }

            self.attempts += 1;
            let attempt = Attempt {
                number: self.attempts,
                broken: Arc::clone(&self.broken),
            };

            let err = match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if self.broken.load(Ordering::SeqCst) {
                warn!(
                    operation = %self.operation,
                    attempt = self.attempts,
                    error = %err,
                    "Not retrying"
                );
                return Err(RetryError::Aborted {
                    attempts: self.attempts,
                    source: err,
                });
            }

            if self.attempts >= self.policy.max_attempts {
                error!(
                    operation = %self.operation,
                    attempts = self.attempts,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    error = %err,
                    "Giving up"
                );
                return Err(RetryError::Exhausted {
                    attempts: self.attempts,
                    source: err,
                });
            }

            let delay = self.policy.delay_for_retry(self.attempts);
            warn!(
                operation = %self.operation,
                attempt = self.attempts,
                max_attempts = self.policy.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Attempt failed, retrying"
            );

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(RetryError::Cancelled {
                        attempts: self.attempts,
                        last: Some(err),
                    });
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
