//! Bounded exponential-backoff retry for outbound calls.
//!
//! ```text
//! delay(attempt) = min(base · 2^attempt + jitter, max)
//! ```
//!
//! Rate-limited failures sleep an extra fixed pause (or the source's own
//! `retry_after`, whichever is longer) before the normal backoff. An expired
//! token gets exactly one refresh-and-retry that does not count as an attempt.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use gleaner_config::RetrySection;
use rand::Rng;

use crate::error::SourceError;

/// Decides whether a failed attempt is worth retrying.
pub type RetryPredicate = Arc<dyn Fn(&SourceError, u32) -> bool + Send + Sync>;

/// Backoff parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_jitter: Duration,
    pub rate_limit_pause: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetrySection::default().into()
    }
}

impl From<RetrySection> for RetryPolicy {
    fn from(section: RetrySection) -> Self {
        Self {
            max_retries: section.max_retries,
            base_delay: Duration::from_millis(section.base_delay_ms),
            max_delay: Duration::from_millis(section.max_delay_ms),
            max_jitter: Duration::from_millis(section.max_jitter_ms),
            rate_limit_pause: Duration::from_millis(section.rate_limit_pause_ms),
        }
    }
}

impl RetryPolicy {
    /// A policy that never waits. Handy in tests.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            max_jitter: Duration::ZERO,
            rate_limit_pause: Duration::ZERO,
        }
    }

    /// Backoff before retry number `attempt` (zero-based) with a given jitter.
    pub fn backoff_delay(&self, attempt: u32, jitter: Duration) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        let exponential = self.base_delay.saturating_mul(factor);
        exponential.saturating_add(jitter).min(self.max_delay)
    }

    /// Random jitter in `[0, max_jitter]`.
    fn jitter(&self) -> Duration {
        let max = self.max_jitter.as_millis() as u64;
        if max == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::rng().random_range(0..=max))
    }
}

/// Default predicate: defer to the error's own classification.
pub fn default_should_retry(error: &SourceError, _attempt: u32) -> bool {
    error.is_retryable()
}

/// Runs units of work under a [`RetryPolicy`].
#[derive(Clone)]
pub struct RetryExecutor {
    policy: RetryPolicy,
    should_retry: RetryPredicate,
}

impl std::fmt::Debug for RetryExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryExecutor")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            should_retry: Arc::new(default_should_retry),
        }
    }

    /// Replace the retryability predicate.
    pub fn with_predicate(
        mut self,
        predicate: impl Fn(&SourceError, u32) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.should_retry = Arc::new(predicate);
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `f` until it succeeds, fails permanently, or retries run out.
    pub async fn run<F, Fut, T>(&self, operation: &str, f: F) -> Result<T, SourceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SourceError>>,
    {
        self.run_with_refresh(operation, f, || std::future::ready(false))
            .await
    }

    /// Like [`run`](Self::run), but an expired token first triggers one call
    /// to `refresh`. If the refresh succeeds the call is repeated without
    /// consuming an attempt; otherwise the error is returned as is.
    pub async fn run_with_refresh<F, Fut, T, R, RFut>(
        &self,
        operation: &str,
        mut f: F,
        mut refresh: R,
    ) -> Result<T, SourceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SourceError>>,
        R: FnMut() -> RFut,
        RFut: Future<Output = bool>,
    {
        let mut attempt = 0u32;
        let mut refreshed = false;

        loop {
            let err = match f().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if err.is_token_expired() && !refreshed {
                refreshed = true;
                if refresh().await {
                    tracing::info!(operation, "Credentials refreshed, retrying");
                    continue;
                }
                tracing::warn!(operation, error = %err, "Credential refresh failed");
                return Err(err);
            }

            if attempt >= self.policy.max_retries || !(self.should_retry)(&err, attempt) {
                return Err(err);
            }

            let mut backoff = self.policy.backoff_delay(attempt, self.policy.jitter());
            if err.is_rate_limited() {
                let pause = err
                    .retry_after
                    .unwrap_or_default()
                    .max(self.policy.rate_limit_pause);
                backoff = backoff.saturating_add(pause);
            }

            tracing::warn!(
                operation,
                attempt = attempt + 1,
                max_retries = self.policy.max_retries,
                backoff_ms = backoff.as_millis() as u64,
                error = %err,
                "Request failed, retrying"
            );
            tokio::time::sleep(backoff).await;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
            max_jitter: Duration::ZERO,
            rate_limit_pause: Duration::from_millis(500),
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let p = policy();
        assert_eq!(p.backoff_delay(0, Duration::ZERO), Duration::from_millis(100));
        assert_eq!(p.backoff_delay(1, Duration::ZERO), Duration::from_millis(200));
        assert_eq!(p.backoff_delay(2, Duration::from_millis(7)), Duration::from_millis(407));
        assert_eq!(p.backoff_delay(5, Duration::ZERO), Duration::from_millis(1000));
        assert_eq!(p.backoff_delay(40, Duration::ZERO), Duration::from_millis(1000));
    }

    #[test]
    fn test_jitter_is_bounded() {
        let p = RetryPolicy {
            max_jitter: Duration::from_millis(50),
            ..policy()
        };
        for _ in 0..100 {
            assert!(p.jitter() <= Duration::from_millis(50));
        }
        assert_eq!(policy().jitter(), Duration::ZERO);
    }

    #[test]
    fn test_policy_from_config() {
        let p: RetryPolicy = RetrySection::default().into();
        assert_eq!(p.max_retries, 3);
        assert_eq!(p.base_delay, Duration::from_secs(1));
        assert_eq!(p.max_delay, Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_then_succeeds() {
        let calls = &AtomicU32::new(0);
        let executor = RetryExecutor::new(policy());
        let started = tokio::time::Instant::now();

        let result = executor
            .run("fetch", || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(SourceError::http(503, "unavailable"))
                } else {
                    Ok(42)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 100ms + 200ms of backoff
        assert!(started.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_retries() {
        let calls = &AtomicU32::new(0);
        let executor = RetryExecutor::new(policy());

        let result: Result<(), _> = executor
            .run("fetch", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(SourceError::network("connection reset"))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_fails_fast() {
        let calls = &AtomicU32::new(0);
        let executor = RetryExecutor::new(policy());

        let result: Result<(), _> = executor
            .run("fetch", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(SourceError::http(403, "forbidden"))
            })
            .await;

        assert_eq!(result.unwrap_err().status, Some(403));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_adds_pause() {
        let calls = &AtomicU32::new(0);
        let executor = RetryExecutor::new(policy());
        let started = tokio::time::Instant::now();

        executor
            .run("fetch", || async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(SourceError::rate_limited("slow down", None))
                } else {
                    Ok(())
                }
            })
            .await
            .unwrap();

        // backoff 100ms + fixed pause 500ms
        assert!(started.elapsed() >= Duration::from_millis(600));
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_predicate() {
        let calls = &AtomicU32::new(0);
        let executor = RetryExecutor::new(policy()).with_predicate(|_, attempt| attempt < 1);

        let result: Result<(), _> = executor
            .run("fetch", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(SourceError::other("anything"))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_token_refreshes_once() {
        let calls = &AtomicU32::new(0);
        let refreshes = &AtomicU32::new(0);
        let executor = RetryExecutor::new(policy());

        let result = executor
            .run_with_refresh(
                "fetch",
                || async move {
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(SourceError::token_expired("token expired"))
                    } else {
                        Ok("ok")
                    }
                },
                || async move {
                    refreshes.fetch_add(1, Ordering::SeqCst);
                    true
                },
            )
            .await;

        assert_eq!(result.unwrap(), "ok");
        assert_eq!(refreshes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_token_after_refresh_fails() {
        let calls = &AtomicU32::new(0);
        let refreshes = &AtomicU32::new(0);
        let executor = RetryExecutor::new(policy());

        let result: Result<(), _> = executor
            .run_with_refresh(
                "fetch",
                || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(SourceError::token_expired("token expired"))
                },
                || async move {
                    refreshes.fetch_add(1, Ordering::SeqCst);
                    true
                },
            )
            .await;

        assert!(result.unwrap_err().is_token_expired());
        assert_eq!(refreshes.load(Ordering::SeqCst), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
