//! Attempt-level retry with classified exponential backoff.
//!
//! [`RetryExecutor::run`] drives an attempt closure until it succeeds, hits
//! a non-retryable classification, or runs out of attempts. Failures never
//! escape as errors: the caller always receives a [`FetchOutcome`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::RetryPolicy;
use crate::error::{FetchError, FetchErrorKind};
use crate::models::FetchOutcome;
use crate::rate_limit::{Congestion, RateLimiter};

/// Delay before the retry that follows failed attempt number `attempt`
/// (zero-based).
///
/// `base * 2^attempt`, multiplied by `rate_limited_factor` for throttled
/// attempts, plus `jitter`, capped at `max_delay`.
pub fn backoff_delay(
    policy: &RetryPolicy,
    kind: FetchErrorKind,
    attempt: u32,
    jitter: Duration,
) -> Duration {
    let exp = 2f64.powi(attempt.min(32) as i32);
    let mut millis = policy.base_delay_ms as f64 * exp;
    if kind == FetchErrorKind::RateLimited {
        millis *= policy.rate_limited_factor.max(1.0);
    }
    let cap = policy.max_delay_ms as f64;
    let delay = Duration::from_millis(millis.min(cap) as u64) + jitter;
    delay.min(policy.max_delay())
}

fn random_jitter(max_ms: u64) -> Duration {
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::rng().random_range(0..=max_ms))
}

pub struct RetryExecutor {
    policy: RetryPolicy,
    limiter: Option<Arc<RateLimiter>>,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            limiter: None,
        }
    }

    /// Feed congestion signals into a shared limiter.
    pub fn with_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Invoke `attempt_fn` up to `max_retries + 1` times.
    ///
    /// The closure receives the zero-based attempt number. Backoff sleeps
    /// only suspend the current task.
    pub async fn run<F, Fut>(&self, mut attempt_fn: F) -> FetchOutcome
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<Vec<u8>, FetchError>>,
    {
        let started = Instant::now();
        let max_attempts = self.policy.max_retries + 1;
        let mut attempt = 0;

        loop {
            let err = match attempt_fn(attempt).await {
                Ok(payload) => {
                    self.signal(Congestion::Clear);
                    return FetchOutcome::succeeded(payload, attempt + 1, started.elapsed());
                }
                Err(err) => err,
            };

            if err.kind == FetchErrorKind::RateLimited {
                self.signal(Congestion::Throttled {
                    retry_after: err.retry_after,
                });
            }

            let attempts_made = attempt + 1;
            if !err.kind.is_retryable() || attempts_made >= max_attempts {
                warn!(
                    kind = %err.kind,
                    attempts = attempts_made,
                    error = %err.message,
                    "giving up after failed attempt"
                );
                return FetchOutcome::failed(err, attempts_made, started.elapsed());
            }

            let mut delay = backoff_delay(
                &self.policy,
                err.kind,
                attempt,
                random_jitter(self.policy.jitter_ms),
            );
            if let Some(hint) = err.retry_after {
                delay = delay.max(hint.min(self.policy.max_delay()));
            }
            debug!(
                kind = %err.kind,
                attempt = attempts_made,
                delay_ms = delay.as_millis() as u64,
                "attempt failed; backing off"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    fn signal(&self, congestion: Congestion) {
        if let Some(limiter) = &self.limiter {
            limiter.report(congestion);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateLimitConfig;
    use std::sync::Mutex;

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            rate_limited_factor: 2.0,
            jitter_ms: 0,
        }
    }

    #[test]
    fn test_backoff_doubles_per_attempt() {
        let p = policy(3);
        let kind = FetchErrorKind::TransientNetwork;
        assert_eq!(backoff_delay(&p, kind, 0, Duration::ZERO), Duration::from_millis(1_000));
        assert_eq!(backoff_delay(&p, kind, 1, Duration::ZERO), Duration::from_millis(2_000));
        assert_eq!(backoff_delay(&p, kind, 2, Duration::ZERO), Duration::from_millis(4_000));
    }

    #[test]
    fn test_rate_limited_backoff_exceeds_transient() {
        let p = policy(3);
        for attempt in 0..4 {
            let throttled = backoff_delay(&p, FetchErrorKind::RateLimited, attempt, Duration::ZERO);
            let transient =
                backoff_delay(&p, FetchErrorKind::TransientNetwork, attempt, Duration::ZERO);
            assert!(throttled > transient, "attempt {}", attempt);
        }
    }

    #[test]
    fn test_backoff_capped_at_max_delay() {
        let p = policy(3);
        let d = backoff_delay(
            &p,
            FetchErrorKind::RateLimited,
            20,
            Duration::from_millis(400),
        );
        assert_eq!(d, Duration::from_millis(60_000));
    }

    #[test]
    fn test_jitter_is_bounded() {
        for _ in 0..100 {
            assert!(random_jitter(250) <= Duration::from_millis(250));
        }
        assert_eq!(random_jitter(0), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_transient_makes_exactly_four_attempts() {
        let exec = RetryExecutor::new(policy(3));
        let stamps = Mutex::new(Vec::new());

        let outcome = exec
            .run(|_| {
                stamps.lock().unwrap().push(Instant::now());
                async { Err(FetchError::new(FetchErrorKind::TransientNetwork, "reset")) }
            })
            .await;

        assert!(!outcome.success);
        assert_eq!(outcome.attempt_count, 4);
        assert_eq!(outcome.error_kind(), Some(FetchErrorKind::TransientNetwork));

        let stamps = stamps.into_inner().unwrap();
        assert_eq!(stamps.len(), 4);
        let gaps: Vec<Duration> = stamps.windows(2).map(|w| w[1] - w[0]).collect();
        for pair in gaps.windows(2) {
            assert!(pair[1] >= pair[0]);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_client_error_is_not_retried() {
        let exec = RetryExecutor::new(policy(3));
        let calls = Mutex::new(0u32);
        let outcome = exec
            .run(|_| {
                *calls.lock().unwrap() += 1;
                async { Err(FetchError::new(FetchErrorKind::PermanentClient, "400")) }
            })
            .await;
        assert_eq!(*calls.lock().unwrap(), 1);
        assert_eq!(outcome.attempt_count, 1);
        assert_eq!(outcome.error_kind(), Some(FetchErrorKind::PermanentClient));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_after_transient_failures() {
        let exec = RetryExecutor::new(policy(3));
        let outcome = exec
            .run(|attempt| async move {
                if attempt < 2 {
                    Err(FetchError::new(FetchErrorKind::UpstreamServer, "503"))
                } else {
                    Ok(b"a,b\n1,2\n".to_vec())
                }
            })
            .await;
        assert!(outcome.success);
        assert_eq!(outcome.attempt_count, 3);
        assert_eq!(outcome.payload.as_deref(), Some(&b"a,b\n1,2\n"[..]));
        // 1s + 2s of backoff on virtual time
        assert_eq!(outcome.elapsed, Duration::from_millis(3_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_reports_congestion() {
        let limiter = Arc::new(RateLimiter::new(RateLimitConfig {
            min_interval_ms: 100,
            max_interval_ms: 10_000,
            ..RateLimitConfig::default()
        }));
        let exec = RetryExecutor::new(policy(1)).with_limiter(limiter.clone());
        let outcome = exec
            .run(|_| async { Err(FetchError::new(FetchErrorKind::RateLimited, "429")) })
            .await;
        assert_eq!(outcome.attempt_count, 2);
        assert_eq!(limiter.current_interval(), Duration::from_millis(400));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_hint_extends_delay() {
        let exec = RetryExecutor::new(policy(1));
        let outcome = exec
            .run(|attempt| async move {
                if attempt == 0 {
                    Err(FetchError::new(FetchErrorKind::RateLimited, "429")
                        .with_retry_after(Some(Duration::from_secs(10))))
                } else {
                    Ok(vec![1])
                }
            })
            .await;
        assert!(outcome.success);
        assert_eq!(outcome.elapsed, Duration::from_secs(10));
    }
}
