use std::time::Duration;

/// Exponential retry backoff with jitter:
/// `min(base * 2^attempt, cap) ± 20%`.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(2),
            cap: Duration::from_secs(300),
        }
    }
}

impl BackoffPolicy {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self.base.as_secs_f64() * 2f64.powi(attempt.min(30) as i32);
        let capped = exp.min(self.cap.as_secs_f64());

        // ±20% jitter so retries from parallel workers spread out.
        let jitter = capped * 0.2 * (rand::random::<f64>() * 2.0 - 1.0);
        Duration::from_secs_f64((capped + jitter).max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_grows_and_caps() {
        let policy = BackoffPolicy::default();

        for attempt in 0..10 {
            let expected = (2f64 * 2f64.powi(attempt)).min(300.0);
            let delay = policy.delay(attempt as u32).as_secs_f64();
            assert!(delay >= expected * 0.8 - 1e-6, "attempt {}: {}", attempt, delay);
            assert!(delay <= expected * 1.2 + 1e-6, "attempt {}: {}", attempt, delay);
        }
    }

    #[test]
    fn test_huge_attempt_does_not_overflow() {
        let policy = BackoffPolicy::default();
        let delay = policy.delay(u32::MAX);
        assert!(delay.as_secs_f64() <= 300.0 * 1.2 + 1e-6);
    }
}
