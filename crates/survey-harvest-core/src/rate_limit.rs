//! Shared request pacing.
//!
//! [`RateLimiter`] hands out request slots spaced at least one interval
//! apart. Callers reserve a slot under a short lock and then sleep until
//! it opens, so concurrent workers queue behind one global cadence
//! instead of keeping independent timers.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::RateLimitConfig;

/// Feedback from a completed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Congestion {
    /// Upstream throttled us. `retry_after` holds the server's hint.
    Throttled { retry_after: Option<Duration> },
    /// A request went through without throttling.
    Clear,
}

struct Pacing {
    next_slot: Option<Instant>,
    interval: Duration,
    clean_streak: u32,
}

pub struct RateLimiter {
    config: RateLimitConfig,
    floor: Duration,
    ceiling: Duration,
    pacing: Mutex<Pacing>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let floor = Duration::from_millis(config.min_interval_ms);
        let ceiling = Duration::from_millis(config.max_interval_ms).max(floor);
        Self {
            config,
            floor,
            ceiling,
            pacing: Mutex::new(Pacing {
                next_slot: None,
                interval: floor,
                clean_streak: 0,
            }),
        }
    }

    /// Wait until the caller may issue its request.
    pub async fn acquire(&self) {
        let slot = {
            let mut pacing = self.pacing.lock().unwrap_or_else(PoisonError::into_inner);
            let now = Instant::now();
            let slot = match pacing.next_slot {
                Some(next) if next > now => next,
                _ => now,
            };
            pacing.next_slot = Some(slot + pacing.interval);
            slot
        };
        tokio::time::sleep_until(slot).await;
    }

    /// Feed back the result of a request.
    ///
    /// Throttling widens the interval by `congestion_factor` up to the
    /// ceiling; `decay_after` consecutive clean requests shrink it by
    /// `decay_factor` back toward the floor.
    pub fn report(&self, signal: Congestion) {
        let mut pacing = self.pacing.lock().unwrap_or_else(PoisonError::into_inner);
        match signal {
            Congestion::Throttled { retry_after } => {
                let widened = pacing.interval.mul_f64(self.config.congestion_factor.max(1.0));
                pacing.interval = widened.min(self.ceiling).max(self.floor);
                pacing.clean_streak = 0;
                if let Some(hint) = retry_after {
                    let hold = Instant::now() + hint.min(self.ceiling);
                    if pacing.next_slot.map_or(true, |next| next < hold) {
                        pacing.next_slot = Some(hold);
                    }
                }
                warn!(interval_ms = pacing.interval.as_millis() as u64, "upstream throttling; widening request interval");
            }
            Congestion::Clear => {
                pacing.clean_streak += 1;
                if pacing.clean_streak >= self.config.decay_after.max(1) && pacing.interval > self.floor {
                    let decayed = pacing.interval.mul_f64(self.config.decay_factor.clamp(0.0, 1.0));
                    pacing.interval = decayed.max(self.floor);
                    pacing.clean_streak = 0;
                    debug!(interval_ms = pacing.interval.as_millis() as u64, "request interval decayed");
                }
            }
        }
    }

    /// The interval currently enforced between grants.
    pub fn current_interval(&self) -> Duration {
        self.pacing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn limiter(min_ms: u64, max_ms: u64) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            min_interval_ms: min_ms,
            max_interval_ms: max_ms,
            congestion_factor: 2.0,
            decay_after: 2,
            decay_factor: 0.5,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_acquire_is_immediate() {
        let rl = limiter(1_000, 10_000);
        let start = Instant::now();
        rl.acquire().await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequential_grants_are_spaced() {
        let rl = limiter(1_000, 10_000);
        let start = Instant::now();
        rl.acquire().await;
        rl.acquire().await;
        rl.acquire().await;
        assert_eq!(start.elapsed(), Duration::from_millis(2_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_one_cadence() {
        let rl = Arc::new(limiter(500, 10_000));
        let start = Instant::now();
        let mut handles = Vec::new();
        for _ in 0..4 {
            let rl = rl.clone();
            handles.push(tokio::spawn(async move {
                rl.acquire().await;
                Instant::now()
            }));
        }
        let mut grants = Vec::new();
        for h in handles {
            grants.push(h.await.unwrap());
        }
        grants.sort();
        for pair in grants.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(500));
        }
        assert_eq!(*grants.last().unwrap() - start, Duration::from_millis(1_500));
    }

    #[test]
    fn test_throttling_widens_up_to_ceiling() {
        let rl = limiter(1_000, 3_000);
        rl.report(Congestion::Throttled { retry_after: None });
        assert_eq!(rl.current_interval(), Duration::from_millis(2_000));
        rl.report(Congestion::Throttled { retry_after: None });
        assert_eq!(rl.current_interval(), Duration::from_millis(3_000));
    }

    #[test]
    fn test_clean_streak_decays_to_floor() {
        let rl = limiter(1_000, 8_000);
        rl.report(Congestion::Throttled { retry_after: None });
        rl.report(Congestion::Throttled { retry_after: None });
        assert_eq!(rl.current_interval(), Duration::from_millis(4_000));

        rl.report(Congestion::Clear);
        assert_eq!(rl.current_interval(), Duration::from_millis(4_000));
        rl.report(Congestion::Clear);
        assert_eq!(rl.current_interval(), Duration::from_millis(2_000));
        for _ in 0..10 {
            rl.report(Congestion::Clear);
        }
        assert_eq!(rl.current_interval(), Duration::from_millis(1_000));
    }

    #[test]
    fn test_throttle_resets_clean_streak() {
        let rl = limiter(1_000, 8_000);
        rl.report(Congestion::Throttled { retry_after: None });
        rl.report(Congestion::Clear);
        rl.report(Congestion::Throttled { retry_after: None });
        rl.report(Congestion::Clear);
        assert_eq!(rl.current_interval(), Duration::from_millis(4_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_holds_next_slot() {
        let rl = limiter(100, 10_000);
        let start = Instant::now();
        rl.report(Congestion::Throttled {
            retry_after: Some(Duration::from_secs(3)),
        });
        rl.acquire().await;
        assert!(start.elapsed() >= Duration::from_secs(3));
    }
}
