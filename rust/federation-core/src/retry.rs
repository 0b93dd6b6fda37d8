// rust/federation-core/src/retry.rs

//! Backoff policy for optimistic commits that lose a race.
//!
//! The ledger's compare-and-commit reports a conflict when another round
//! moved a touched balance between authorization and commit. The caller
//! re-authorizes and tries again under this policy.

use std::time::Duration;

use rand::Rng;

use crate::config::LedgerConfig;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Stretch each delay by up to 25% at random.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::from(&LedgerConfig::default())
    }
}

impl From<&LedgerConfig> for RetryConfig {
    fn from(ledger: &LedgerConfig) -> Self {
        Self {
            max_retries: ledger.max_retries,
            initial_delay: Duration::from_millis(ledger.retry_delay_ms),
            max_delay: Duration::from_millis(ledger.max_retry_delay_ms),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Delay before retry number `attempt` (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt >= self.max_retries {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let base = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let capped = base.min(self.max_delay.as_secs_f64());

        if self.jitter {
            let factor = 1.0 + rand::thread_rng().gen_range(0.0..0.25);
            Duration::from_secs_f64(capped * factor)
        } else {
            Duration::from_secs_f64(capped)
        }
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}

/// Outcome of one attempt of a retryable operation.
#[derive(Debug)]
pub enum RetryResult<T, E> {
    Ok(T),
    /// Transient failure; try again if the policy allows.
    Retry(E),
    Fail(E),
}

impl<T, E> RetryResult<T, E> {
    pub fn should_retry(&self) -> bool {
        matches!(self, Self::Retry(_))
    }

    pub fn into_result(self) -> Result<T, E> {
        match self {
            Self::Ok(v) => Ok(v),
            Self::Retry(e) | Self::Fail(e) => Err(e),
        }
    }
}

/// Run `operation` until it succeeds, fails hard, or the policy is exhausted.
///
/// On exhaustion the last `Retry` error is returned.
pub async fn retry_async<T, E, F, Fut>(config: &RetryConfig, mut operation: F) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: std::future::Future<Output = RetryResult<T, E>>,
{
    let mut attempt = 0;

    loop {
        match operation(attempt).await {
            RetryResult::Ok(value) => return Ok(value),
            RetryResult::Fail(error) => return Err(error),
            RetryResult::Retry(error) => {
                if !config.should_retry(attempt) {
                    return Err(error);
                }
                tokio::time::sleep(config.delay_for_attempt(attempt)).await;
                attempt += 1;
            }
        }
    }
}
