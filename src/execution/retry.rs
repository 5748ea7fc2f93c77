use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::error::ExchangeError;

/// Bounded retry with exponential backoff and a per-attempt timeout
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub call_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            call_timeout: Duration::from_secs(10),
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`: base * 2^(attempt-1), capped, plus up to 25% jitter
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .backoff_base
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
            .min(self.backoff_max);
        let jitter_ms = (exp.as_millis() as u64) / 4;
        if jitter_ms == 0 {
            return exp;
        }
        exp + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }

    /// Backoff after a failed attempt, stretched to any retry-after hint
    pub fn delay_after(&self, attempt: u32, err: &ExchangeError) -> Duration {
        let delay = self.backoff(attempt);
        match err {
            ExchangeError::RateLimited {
                retry_after: Some(hint),
            } => delay.max(*hint),
            _ => delay,
        }
    }
}

/// Classified outcome of one attempt
#[derive(Debug)]
pub enum Attempt<T> {
    Done(T),
    Retry(ExchangeError),
    Fail(ExchangeError),
}

impl<T> From<Result<T, ExchangeError>> for Attempt<T> {
    fn from(result: Result<T, ExchangeError>) -> Self {
        match result {
            Ok(value) => Attempt::Done(value),
            Err(e) if e.is_retryable() => Attempt::Retry(e),
            Err(e) => Attempt::Fail(e),
        }
    }
}

/// Run `op` until it succeeds, fails permanently, or the attempt budget is spent.
///
/// Each attempt is bounded by `policy.call_timeout`. A `RateLimited` error
/// carrying a retry-after hint waits at least that long.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, label: &str, mut op: F) -> Result<T, ExchangeError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ExchangeError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;

        let outcome: Attempt<T> = match tokio::time::timeout(policy.call_timeout, op()).await {
            Ok(result) => result.into(),
            Err(_) => Attempt::Retry(ExchangeError::Timeout(policy.call_timeout)),
        };

        let err = match outcome {
            Attempt::Done(value) => return Ok(value),
            Attempt::Fail(e) => return Err(e),
            Attempt::Retry(e) => e,
        };

        if attempt >= max_attempts {
            tracing::warn!("{} failed after {} attempts: {}", label, attempt, err);
            return Err(err);
        }

        let delay = policy.delay_after(attempt, &err);
        tracing::debug!(
            "{} failed: {}, retrying in {}ms (attempt {}/{})",
            label,
            err,
            delay.as_millis(),
            attempt,
            max_attempts
        );
        tokio::time::sleep(delay).await;
    }
}
