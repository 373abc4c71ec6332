//! Process-wide request rate limiting.
//!
//! Token bucket with rate R tokens per second and burst capacity
//! ⌈1.2 × R⌉. `allow` refills lazily from the elapsed time and consumes
//! one token when available; a refusal consumes nothing.

use std::time::Instant;

use parking_lot::Mutex;

/// Burst headroom over the sustained rate.
pub const BURST_RATIO: f64 = 1.2;

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_update: Instant,
}

#[derive(Debug)]
pub struct RateLimiter {
    rate: f64,
    burst: f64,
    state: Mutex<BucketState>,
}

impl RateLimiter {
    /// Create a limiter for `rate` requests per second. A non-positive
    /// rate admits nothing.
    #[must_use]
    pub fn new(rate: f64) -> Self {
        let burst = (rate * BURST_RATIO).ceil().max(0.0);
        Self {
            rate,
            burst,
            state: Mutex::new(BucketState {
                tokens: burst,
                last_update: Instant::now(),
            }),
        }
    }

    #[must_use]
    pub fn rate(&self) -> f64 {
        self.rate
    }

    #[must_use]
    pub fn burst(&self) -> f64 {
        self.burst
    }

    /// Whether one more request may proceed now.
    #[must_use]
    pub fn allow(&self) -> bool {
        self.allow_at(Instant::now())
    }

    fn allow_at(&self, now: Instant) -> bool {
        if self.rate <= 0.0 {
            return false;
        }
        let mut state = self.state.lock();
        let elapsed = now.saturating_duration_since(state.last_update);
        state.tokens = (state.tokens + elapsed.as_secs_f64() * self.rate).min(self.burst);
        state.last_update = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn burst_is_ceiled_ratio_of_rate() {
        let limiter = RateLimiter::new(10.0);
        assert_eq!(limiter.burst(), 12.0);

        let limiter = RateLimiter::new(5.0);
        assert_eq!(limiter.burst(), 6.0);
    }

    #[test]
    fn allows_burst_then_rejects() {
        let limiter = RateLimiter::new(10.0);
        let now = Instant::now();

        for i in 0..12 {
            assert!(limiter.allow_at(now), "request {i} within burst");
        }
        assert!(!limiter.allow_at(now), "13th request exceeds the burst");
    }

    #[test]
    fn refusal_consumes_no_token() {
        let limiter = RateLimiter::new(1.0);
        let now = Instant::now();

        assert!(limiter.allow_at(now));
        assert!(!limiter.allow_at(now));
        assert!(!limiter.allow_at(now));

        // One full second refills exactly one token despite the refusals.
        assert!(limiter.allow_at(now + Duration::from_secs(1)));
    }

    #[test]
    fn tokens_refill_at_the_configured_rate() {
        let limiter = RateLimiter::new(10.0);
        let now = Instant::now();

        for _ in 0..12 {
            assert!(limiter.allow_at(now));
        }
        assert!(!limiter.allow_at(now));

        assert!(limiter.allow_at(now + Duration::from_millis(100)));
        assert!(!limiter.allow_at(now + Duration::from_millis(100)));
    }

    #[test]
    fn sustained_rate_is_admitted() {
        let limiter = RateLimiter::new(10.0);
        let start = Instant::now();

        // One request every 100ms for 3 seconds: exactly the sustained rate.
        for tick in 0..30 {
            let at = start + Duration::from_millis(tick * 100);
            assert!(limiter.allow_at(at), "sustained request {tick} rejected");
        }
    }

    #[test]
    fn zero_rate_admits_nothing() {
        let limiter = RateLimiter::new(0.0);
        assert!(!limiter.allow());
    }
}
