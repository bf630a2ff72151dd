//! Backoff schedule for transient-failure retries.

use std::time::Duration;

use crate::error::PipelineError;

/// Exponential backoff: retry attempt `n` (0-indexed) waits `base * 2^n`,
/// capped, with up to a quarter of the computed delay added as jitter so
/// synchronized retries spread out. The cap bounds the jittered delay too.
///
/// Stage retries and LLM rate-limit backoff share this schedule; the only
/// knob that differs between them is the attempt budget.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    max_attempts: u32,
    jitter: bool,
}

impl Backoff {
    /// The standard schedule: 1 s base, doubling, capped at 60 s.
    pub fn with_attempts(max_attempts: u32) -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(60),
            max_attempts,
            jitter: true,
        }
    }

    /// Whether the budget still allows retry number `attempt` (0-indexed).
    pub fn allows(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Budget check combined with the error's own retryability.
    pub fn should_retry(&self, error: &PipelineError, attempt: u32) -> bool {
        error.retryable && self.allows(attempt)
    }

    /// Delay before retry number `attempt` (0-indexed).
    pub fn delay(&self, attempt: u32) -> Duration {
        // The doubling factor saturates, so a runaway attempt counter
        // lands on the cap instead of overflowing.
        let factor = 2u32.saturating_pow(attempt.min(16));
        let capped = self.base.saturating_mul(factor).min(self.cap);

        if !self.jitter {
            return capped;
        }
        let jittered = capped + capped.mul_f64(rand::random::<f64>() * 0.25);
        jittered.min(self.cap)
    }

    #[cfg(test)]
    fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_budget_bounds_attempts() {
        let backoff = Backoff::with_attempts(3);
        assert!(backoff.allows(0));
        assert!(backoff.allows(2));
        assert!(!backoff.allows(3));

        assert!(!Backoff::with_attempts(0).allows(0));
    }

    #[test]
    fn test_delay_doubles_until_cap() {
        let backoff = Backoff::with_attempts(10).without_jitter();
        assert_eq!(backoff.delay(0), Duration::from_secs(1));
        assert_eq!(backoff.delay(1), Duration::from_secs(2));
        assert_eq!(backoff.delay(2), Duration::from_secs(4));
        assert_eq!(backoff.delay(5), Duration::from_secs(32));
        assert_eq!(backoff.delay(6), Duration::from_secs(60));
        assert_eq!(backoff.delay(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn test_jitter_never_exceeds_cap() {
        let backoff = Backoff::with_attempts(10);
        for attempt in 0..12 {
            assert!(backoff.delay(attempt) <= Duration::from_secs(60));
        }
    }

    #[test]
    fn test_should_retry_respects_error_retryability() {
        let backoff = Backoff::with_attempts(3);

        let transient = PipelineError::new(ErrorKind::TransientNetwork, "reset");
        assert!(backoff.should_retry(&transient, 0));
        assert!(!backoff.should_retry(&transient, 3));

        let fatal = PipelineError::invalid_input("bad url");
        assert!(!backoff.should_retry(&fatal, 0));
    }
}
