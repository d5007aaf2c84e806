//! Provider error taxonomy and the bounded-retry combinator.
//!
//! Every call to an external text or embedding provider goes through
//! [`with_retry`], so retry counting and backoff live in exactly one place.
//! Errors are classified up front: rate limits and server/network faults
//! are retryable, everything else fails the record immediately.

use std::future::Future;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProviderError {
    /// The provider asked us to slow down (HTTP 429). Retryable, and the
    /// calling stage additionally lengthens its inter-batch delay.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Timeout, connection failure, or 5xx. Retryable.
    #[error("transient provider error: {0}")]
    Transient(String),

    /// Malformed input, auth failure, or any other 4xx. Not retryable.
    #[error("permanent provider error: {0}")]
    Permanent(String),

    /// The provider returned a vector of the wrong length. Never stored.
    #[error("embedding dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
}

impl ProviderError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::RateLimited(_) | ProviderError::Transient(_)
        )
    }

    pub fn is_rate_limit(&self) -> bool {
        matches!(self, ProviderError::RateLimited(_))
    }
}

/// Classify an HTTP response status into the provider error taxonomy:
/// 429 is a rate limit, 5xx is transient, anything else client-side is
/// permanent.
pub fn classify_http_status(status: u16, detail: String) -> ProviderError {
    match status {
        429 => ProviderError::RateLimited(detail),
        500..=599 => ProviderError::Transient(format!("HTTP {}: {}", status, detail)),
        _ => ProviderError::Permanent(format!("HTTP {}: {}", status, detail)),
    }
}

/// Delay schedule between retry attempts.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub exponential: bool,
    pub cap: Duration,
}

impl BackoffPolicy {
    pub fn fixed(base: Duration) -> Self {
        Self {
            base,
            exponential: false,
            cap: base,
        }
    }

    pub fn exponential(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            exponential: true,
            cap,
        }
    }

    /// Delay before retry `attempt` (1-based; attempt 0 is the first try
    /// and never sleeps).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        if !self.exponential {
            return self.base;
        }
        let shift = (attempt - 1).min(16);
        let delay = self.base.saturating_mul(1u32 << shift);
        delay.min(self.cap)
    }
}

/// Run `op` up to `max_attempts` times, sleeping per `policy` between
/// attempts. Non-retryable errors return immediately; exhaustion returns
/// the last retryable error.
pub async fn with_retry<T, F, Fut>(
    max_attempts: u32,
    policy: BackoffPolicy,
    mut op: F,
) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let attempts = max_attempts.max(1);
    let mut last_err = None;

    for attempt in 0..attempts {
        if attempt > 0 {
            tokio::time::sleep(policy.delay_for(attempt)).await;
        }

        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() => last_err = Some(e),
            Err(e) => return Err(e),
        }
    }

    Err(last_err.unwrap_or_else(|| ProviderError::Transient("retries exhausted".to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn zero_backoff() -> BackoffPolicy {
        BackoffPolicy::fixed(Duration::ZERO)
    }

    #[tokio::test]
    async fn succeeds_first_try() {
        let calls = Cell::new(0u32);
        let result = with_retry(3, zero_backoff(), || {
            calls.set(calls.get() + 1);
            async { Ok::<_, ProviderError>(42) }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.get(), 1);
    }

    #[tokio::test]
    async fn retries_transient_until_success() {
        let calls = Cell::new(0u32);
        let result = with_retry(3, zero_backoff(), || {
            calls.set(calls.get() + 1);
            let n = calls.get();
            async move {
                if n < 3 {
                    Err(ProviderError::Transient("flaky".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.get(), 3);
    }

    #[tokio::test]
    async fn permanent_error_fails_fast() {
        let calls = Cell::new(0u32);
        let result: Result<u32, _> = with_retry(5, zero_backoff(), || {
            calls.set(calls.get() + 1);
            async { Err(ProviderError::Permanent("bad input".into())) }
        })
        .await;
        assert!(matches!(result, Err(ProviderError::Permanent(_))));
        assert_eq!(calls.get(), 1);
    }

    #[tokio::test]
    async fn exhaustion_returns_last_error() {
        let calls = Cell::new(0u32);
        let result: Result<u32, _> = with_retry(3, zero_backoff(), || {
            calls.set(calls.get() + 1);
            async { Err(ProviderError::RateLimited("slow down".into())) }
        })
        .await;
        assert!(matches!(result, Err(ProviderError::RateLimited(_))));
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn exponential_backoff_caps() {
        let policy =
            BackoffPolicy::exponential(Duration::from_secs(1), Duration::from_secs(8));
        assert_eq!(policy.delay_for(0), Duration::ZERO);
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(4), Duration::from_secs(8));
        assert_eq!(policy.delay_for(10), Duration::from_secs(8));
    }

    #[test]
    fn dimension_mismatch_is_not_retryable() {
        let err = ProviderError::DimensionMismatch {
            expected: 384,
            got: 1536,
        };
        assert!(!err.is_retryable());
    }
}
