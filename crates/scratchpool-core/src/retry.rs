//! Bounded retry with backoff
//!
//! A [`RetryPolicy`] (attempt budget, minimum delay, backoff strategy) drives
//! [`RetryExecutor`], a generic combinator over async operations. Only
//! failures the predicate marks as transient consume budget; anything else is
//! returned immediately.
//!
//! Each attempt is an independent remote call, so wrapped operations must be
//! safe to re-issue (updates keyed by record id, deduplicated creates).

use crate::error::Retryable;
use crate::logging::LogContext;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

/// Delay growth between attempts
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backoff {
    /// Same delay before every retry
    #[default]
    Fixed,
    /// Delay multiplied by `factor` after each retry, capped at `max_delay_ms`
    Exponential { factor: f64, max_delay_ms: u64 },
}

/// Retry budget and pacing
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Delay before the first retry
    pub min_delay_ms: u64,
    /// Backoff strategy
    #[serde(default)]
    pub backoff: Backoff,
}

impl RetryPolicy {
    /// Fixed delay between attempts
    #[inline]
    #[must_use]
    pub fn fixed(max_attempts: u32, min_delay: Duration) -> Self {
        Self {
            max_attempts,
            min_delay_ms: duration_ms(min_delay),
            backoff: Backoff::Fixed,
        }
    }

    /// Exponentially growing delay between attempts
    #[inline]
    #[must_use]
    pub fn exponential(max_attempts: u32, min_delay: Duration, factor: f64, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            min_delay_ms: duration_ms(min_delay),
            backoff: Backoff::Exponential {
                factor,
                max_delay_ms: duration_ms(max_delay),
            },
        }
    }

    /// Single attempt, no retry
    #[inline]
    #[must_use]
    pub fn none() -> Self {
        Self::fixed(1, Duration::ZERO)
    }

    /// Delay before retry number `retry` (1-based)
    #[must_use]
    pub fn delay_for(&self, retry: u32) -> Duration {
        let base = Duration::from_millis(self.min_delay_ms);
        match self.backoff {
            Backoff::Fixed => base,
            Backoff::Exponential {
                factor,
                max_delay_ms,
            } => {
                let exp = i32::try_from(retry.saturating_sub(1)).unwrap_or(i32::MAX);
                let scaled = base.as_secs_f64() * factor.max(1.0).powi(exp);
                let capped = scaled.min(Duration::from_millis(max_delay_ms).as_secs_f64());
                Duration::from_secs_f64(capped.max(base.as_secs_f64()))
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(3, Duration::from_secs(3))
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Generic retry combinator bound to one policy
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    policy: RetryPolicy,
    log: LogContext,
}

impl RetryExecutor {
    /// Create executor
    #[inline]
    #[must_use]
    pub fn new(policy: RetryPolicy, log: LogContext) -> Self {
        Self { policy, log }
    }

    /// Policy in use
    #[inline]
    #[must_use]
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `operation`, retrying failures classified transient by [`Retryable`]
    ///
    /// # Errors
    /// The first non-transient error, or the last transient error once the
    /// attempt budget is spent.
    pub async fn execute<T, E, F, Fut>(&self, name: &str, operation: F) -> Result<T, E>
    where
        E: Retryable + Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.execute_if(name, |e: &E| e.is_transient(), operation).await
    }

    /// Run `operation`, retrying failures for which `retry_if` returns true
    ///
    /// # Errors
    /// See [`RetryExecutor::execute`].
    pub async fn execute_if<T, E, F, Fut, P>(
        &self,
        name: &str,
        retry_if: P,
        mut operation: F,
    ) -> Result<T, E>
    where
        E: Display,
        P: Fn(&E) -> bool,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;

            match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::debug!(parent: self.log.span(), "{name} succeeded on attempt {attempt}");
                    }
                    return Ok(value);
                }
                Err(err) if !retry_if(&err) => return Err(err),
                Err(err) if attempt >= max_attempts => {
                    tracing::warn!(
                        parent: self.log.span(),
                        "{name} failed after {attempt} attempts: {err}"
                    );
                    return Err(err);
                }
                Err(err) => {
                    let delay = self.policy.delay_for(attempt);
                    tracing::warn!(
                        parent: self.log.span(),
                        "{name} attempt {attempt}/{max_attempts} failed: {err}. Retrying in {delay:?}"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
