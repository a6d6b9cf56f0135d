//! Client-side throttling for the carrier: a token bucket with a concurrency
//! cap and minimum request spacing, plus an in-process circuit breaker.
//!
//! Both are construct-and-inject dependencies, not ambient globals, so tests
//! can build deterministic instances.

use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::time::Instant;

/// Token-bucket rate limiter with a concurrency cap.
///
/// Defaults match the carrier contract: 20 ops/s sustained, at most 10
/// requests in flight, at least 50ms between request starts.
pub struct RateLimiter {
    concurrency: Semaphore,
    state: Mutex<BucketState>,
    capacity: f64,
    refill_per_sec: f64,
    min_spacing: Duration,
}

struct BucketState {
    tokens: f64,
    refilled_at: Instant,
    last_start: Option<Instant>,
}

/// RAII permit; holding it counts against the concurrency cap.
pub struct RatePermit<'a> {
    _permit: tokio::sync::SemaphorePermit<'a>,
}

impl RateLimiter {
    pub fn new(ops_per_sec: u32, max_concurrent: usize, min_spacing: Duration) -> Self {
        Self {
            concurrency: Semaphore::new(max_concurrent),
            state: Mutex::new(BucketState {
                tokens: ops_per_sec as f64,
                refilled_at: Instant::now(),
                last_start: None,
            }),
            capacity: ops_per_sec as f64,
            refill_per_sec: ops_per_sec as f64,
            min_spacing,
        }
    }

    /// Carrier defaults.
    pub fn for_carrier() -> Self {
        Self::new(20, 10, Duration::from_millis(50))
    }

    /// Wait until a request may start, then hold a concurrency permit for
    /// the duration of the request.
    pub async fn acquire(&self) -> RatePermit<'_> {
        let permit = self
            .concurrency
            .acquire()
            .await
            .expect("rate limiter semaphore closed");

        loop {
            let wait = {
                let mut state = self.state.lock().expect("rate limiter poisoned");
                let now = Instant::now();
                let elapsed = now.duration_since(state.refilled_at).as_secs_f64();
                state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
                state.refilled_at = now;

                let spacing_wait = state
                    .last_start
                    .map(|last| (last + self.min_spacing).saturating_duration_since(now))
                    .unwrap_or(Duration::ZERO);

                if state.tokens >= 1.0 && spacing_wait.is_zero() {
                    state.tokens -= 1.0;
                    state.last_start = Some(now);
                    None
                } else if !spacing_wait.is_zero() {
                    Some(spacing_wait)
                } else {
                    let deficit = 1.0 - state.tokens;
                    Some(Duration::from_secs_f64(deficit / self.refill_per_sec))
                }
            };

            match wait {
                None => return RatePermit { _permit: permit },
                Some(wait) => tokio::time::sleep(wait).await,
            }
        }
    }
}

// ============================================================================
// Circuit breaker
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CircuitState {
    Closed,
    Open { opened_at: Instant },
    HalfOpen,
}

/// In-process circuit breaker wrapping carrier calls: opens after
/// `failure_threshold` consecutive failures, half-opens after `open_for`,
/// closes on the first success.
pub struct CircuitBreaker {
    state: Mutex<CircuitInner>,
    failure_threshold: u32,
    open_for: Duration,
}

struct CircuitInner {
    state: CircuitState,
    consecutive_failures: u32,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, open_for: Duration) -> Self {
        Self {
            state: Mutex::new(CircuitInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
            }),
            failure_threshold,
            open_for,
        }
    }

    /// Carrier defaults: 5 failures, open for 60s.
    pub fn for_carrier() -> Self {
        Self::new(5, Duration::from_secs(60))
    }

    /// Whether a request may proceed right now.
    pub fn allow(&self) -> bool {
        let mut inner = self.state.lock().expect("circuit breaker poisoned");
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open { opened_at } => {
                if opened_at.elapsed() >= self.open_for {
                    inner.state = CircuitState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.state.lock().expect("circuit breaker poisoned");
        inner.consecutive_failures = 0;
        inner.state = CircuitState::Closed;
    }

    pub fn record_failure(&self) {
        let mut inner = self.state.lock().expect("circuit breaker poisoned");
        inner.consecutive_failures += 1;
        if matches!(inner.state, CircuitState::HalfOpen)
            || inner.consecutive_failures >= self.failure_threshold
        {
            inner.state = CircuitState::Open {
                opened_at: Instant::now(),
            };
        }
    }

    pub fn is_open(&self) -> bool {
        !self.allow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn breaker_opens_after_threshold_and_recovers() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(60));
        assert!(breaker.allow());

        breaker.record_failure();
        breaker.record_failure();
        assert!(breaker.allow());
        breaker.record_failure();
        assert!(!breaker.allow());

        tokio::time::advance(Duration::from_secs(61)).await;
        // Half-open: one probe allowed.
        assert!(breaker.allow());
        breaker.record_success();
        assert!(breaker.allow());
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_failure_reopens() {
        let breaker = CircuitBreaker::new(1, Duration::from_secs(10));
        breaker.record_failure();
        assert!(!breaker.allow());

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(breaker.allow());
        breaker.record_failure();
        assert!(!breaker.allow());
    }

    #[tokio::test(start_paused = true)]
    async fn limiter_enforces_spacing() {
        let limiter = RateLimiter::new(1000, 10, Duration::from_millis(50));

        let start = Instant::now();
        drop(limiter.acquire().await);
        drop(limiter.acquire().await);
        drop(limiter.acquire().await);
        // Two spacing gaps between three starts; the paused clock advances
        // exactly by the slept amounts.
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn limiter_caps_concurrency() {
        let limiter = RateLimiter::new(1000, 2, Duration::ZERO);
        let a = limiter.acquire().await;
        let _b = limiter.acquire().await;
        assert_eq!(limiter.concurrency.available_permits(), 0);
        drop(a);
        assert_eq!(limiter.concurrency.available_permits(), 1);
    }
}
