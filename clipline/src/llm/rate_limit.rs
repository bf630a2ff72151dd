//! Token-bucket rate limiting for remote LLM calls.

use std::time::{Duration, Instant};

use tracing::debug;

/// Token bucket sized from a requests-per-minute budget: capacity `rpm`,
/// refill `rpm / 60` tokens per second.
#[derive(Debug)]
pub struct RequestRateLimiter {
    tokens: f64,
    capacity: u32,
    refill_per_s: f64,
    last_refill: Instant,
}

impl RequestRateLimiter {
    pub fn new(rpm: u32) -> Self {
        let rpm = rpm.max(1);
        Self {
            tokens: rpm as f64,
            capacity: rpm,
            refill_per_s: rpm as f64 / 60.0,
            last_refill: Instant::now(),
        }
    }

    /// Try to take a token without waiting.
    pub fn try_acquire(&mut self) -> bool {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Take a token, sleeping until one becomes available.
    ///
    /// Returns the total time waited.
    pub async fn acquire(&mut self) -> Duration {
        let mut total_wait = Duration::ZERO;
        loop {
            self.refill();
            if self.tokens >= 1.0 {
                self.tokens -= 1.0;
                return total_wait;
            }

            let tokens_needed = 1.0 - self.tokens;
            let wait = Duration::from_secs_f64(tokens_needed / self.refill_per_s);
            debug!(wait_ms = wait.as_millis() as u64, "remote call rate limited");
            tokio::time::sleep(wait).await;
            total_wait += wait;
        }
    }

    /// Tokens currently available.
    pub fn available_tokens(&mut self) -> f64 {
        self.refill();
        self.tokens
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill);
        let new_tokens = elapsed.as_secs_f64() * self.refill_per_s;
        self.tokens = (self.tokens + new_tokens).min(self.capacity as f64);
        self.last_refill = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_equals_rpm() {
        let mut limiter = RequestRateLimiter::new(3);
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
    }

    #[test]
    fn test_refill_rate_is_rpm_over_sixty() {
        let limiter = RequestRateLimiter::new(120);
        assert!((limiter.refill_per_s - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_refill_after_wait() {
        let mut limiter = RequestRateLimiter::new(6000); // 100 tokens/s
        while limiter.try_acquire() {}
        std::thread::sleep(Duration::from_millis(30));
        assert!(limiter.try_acquire());
    }

    #[test]
    fn test_zero_rpm_clamped() {
        let mut limiter = RequestRateLimiter::new(0);
        assert!(limiter.try_acquire());
    }
}
