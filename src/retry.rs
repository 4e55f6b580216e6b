use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::FetchError;
use crate::{
    RATE_LIMIT_DELAY_MILLIS, RETRY_BASE_DELAY_MILLIS, RETRY_MAX_ATTEMPTS, RETRY_MAX_DELAY_MILLIS,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Always wait `base_delay`.
    Fixed,
    /// Double the delay after each attempt, capped at `max_delay`.
    Exponential,
}

/// How many times a transient failure is retried and how long to wait in between.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// `None` retries until the operator interrupts the run.
    pub max_attempts: Option<usize>,
    pub backoff: Backoff,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Delay used instead of the backoff when the service answers 429.
    pub rate_limit_delay: Duration,
}

/// Outcome of an operation that did not succeed under the policy.
#[derive(Debug)]
pub enum RetryError<E> {
    /// Not worth retrying, bubbled up right away.
    Fatal(E),
    /// Retryable, but the configured attempts ran out.
    AttemptsExceeded(E),
    /// Shutdown was requested while waiting for the next attempt.
    Cancelled(E),
}

impl<E> RetryError<E> {
    pub fn into_inner(self) -> E {
        match self {
            RetryError::Fatal(e) | RetryError::AttemptsExceeded(e) | RetryError::Cancelled(e) => e,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, RetryError::AttemptsExceeded(_))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: Some(RETRY_MAX_ATTEMPTS),
            backoff: Backoff::Exponential,
            base_delay: Duration::from_millis(RETRY_BASE_DELAY_MILLIS),
            max_delay: Duration::from_millis(RETRY_MAX_DELAY_MILLIS),
            rate_limit_delay: Duration::from_millis(RATE_LIMIT_DELAY_MILLIS),
        }
    }
}

impl RetryPolicy {
    /// Fixed number of attempts (at least one) with fixed or exponential backoff.
    pub fn bounded(max_attempts: usize, backoff: Backoff, base_delay: Duration) -> Self {
        Self {
            max_attempts: Some(max_attempts.max(1)),
            backoff,
            base_delay,
            ..Self::default()
        }
    }

    /// Never gives up on transient failures.
    pub fn unbounded(backoff: Backoff, base_delay: Duration) -> Self {
        Self {
            max_attempts: None,
            backoff,
            base_delay,
            ..Self::default()
        }
    }

    /// Bounded policy that never sleeps, for tests.
    pub fn immediate(max_attempts: usize) -> Self {
        Self {
            max_attempts: Some(max_attempts.max(1)),
            backoff: Backoff::Fixed,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            rate_limit_delay: Duration::ZERO,
        }
    }

    /// Runs `op` until it succeeds, fails permanently or runs out of attempts.
    /// Returns the value together with the number of retries it took.
    ///
    /// `cancel` is only observed while waiting between attempts; a request in flight is
    /// always allowed to finish.
    pub async fn run<F, Fut, T>(
        &self,
        what: &str,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<(T, usize), RetryError<FetchError>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        let mut attempt = 0;

        loop {
            match op().await {
                Ok(value) => return Ok((value, attempt)),
                Err(err) if !err.is_transient() => return Err(RetryError::Fatal(err)),
                Err(err) => {
                    if self.max_attempts.is_some_and(|max| attempt + 1 >= max) {
                        return Err(RetryError::AttemptsExceeded(err));
                    }

                    let delay = if err.is_rate_limited() {
                        self.rate_limit_delay
                    } else {
                        self.backoff_delay(attempt)
                    };
                    let attempts = self
                        .max_attempts
                        .map_or_else(|| "unbounded".to_string(), |m| m.to_string());
                    warn!(
                        "{what}: {err}, retry {}/{attempts} in {:.1}s",
                        attempt + 1,
                        delay.as_secs_f64()
                    );
                    tokio::select! {
                        _ = sleep(delay) => {}
                        _ = cancel.cancelled() => return Err(RetryError::Cancelled(err)),
                    }
                    attempt += 1;
                }
            }
        }
    }

    pub fn backoff_delay(&self, attempt: usize) -> Duration {
        if self.base_delay.is_zero() {
            return Duration::ZERO;
        }

        match self.backoff {
            Backoff::Fixed => self.base_delay,
            Backoff::Exponential => {
                let factor = 1u128 << attempt.min(16);
                let delay_ms = self.base_delay.as_millis().saturating_mul(factor);
                let cap = self.max_delay.max(self.base_delay).as_millis();
                let capped = delay_ms.min(cap);
                Duration::from_millis(capped as u64)
            }
        }
    }
}
