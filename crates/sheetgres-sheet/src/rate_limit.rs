use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::debug;

/// Token-bucket limiter for the shared Sheet client.
///
/// Capacity equals one second of burst at the configured QPS; refill is
/// continuous. `acquire` blocks the calling task until a token is
/// available, so every Sheet call in the engine goes through one of these.
/// After a 429 the effective rate can be halved for a recovery window.
pub struct RateLimiter {
    inner: Mutex<Bucket>,
}

struct Bucket {
    capacity: f64,
    tokens: f64,
    rate: f64,
    configured_rate: f64,
    last_refill: Instant,
    /// While set, the bucket refills at half the configured rate.
    throttled_until: Option<Instant>,
}

impl RateLimiter {
    pub fn new(qps: f64) -> Self {
        let qps = qps.max(0.1);
        Self {
            inner: Mutex::new(Bucket {
                capacity: qps,
                tokens: qps,
                rate: qps,
                configured_rate: qps,
                last_refill: Instant::now(),
                throttled_until: None,
            }),
        }
    }

    /// Take one token, sleeping until one is available.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut bucket = self.inner.lock().unwrap();
                bucket.refill();

                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    None
                } else {
                    let deficit = 1.0 - bucket.tokens;
                    Some(Duration::from_secs_f64(deficit / bucket.rate))
                }
            };

            match wait {
                None => return,
                Some(wait) => tokio::time::sleep(wait).await,
            }
        }
    }

    /// Halve the effective rate for `window` after a quota rejection.
    pub fn throttle(&self, window: Duration) {
        let mut bucket = self.inner.lock().unwrap();
        bucket.throttled_until = Some(Instant::now() + window);
        bucket.rate = bucket.configured_rate / 2.0;
        debug!(rate = bucket.rate, "Sheet rate limiter throttled");
    }

    pub fn current_rate(&self) -> f64 {
        let mut bucket = self.inner.lock().unwrap();
        bucket.refill();
        bucket.rate
    }
}

impl Bucket {
    fn refill(&mut self) {
        let now = Instant::now();

        if let Some(until) = self.throttled_until {
            if now >= until {
                self.throttled_until = None;
                self.rate = self.configured_rate;
            }
        }

        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
            self.last_refill = now;
        }
    }
}
