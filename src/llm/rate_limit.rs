//! Per-process token-bucket rate limiter for LLM calls.
//!
//! Capacity equals the configured requests-per-minute; tokens refill at
//! `rpm / 60` per second. One limiter is shared by every LLM call in the
//! process, so in a horizontally scaled deployment the configured RPM is
//! the **per-worker** share, not a global limit.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

/// Shared token-bucket limiter.
#[derive(Debug)]
pub struct RateLimiter {
    state: Mutex<Bucket>,
}

#[derive(Debug)]
struct Bucket {
    capacity: f64,
    refill_per_sec: f64,
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }
}

impl RateLimiter {
    /// Create a limiter for `rpm` requests per minute (minimum 1).
    pub fn new(rpm: u32) -> Self {
        let rpm = f64::from(rpm.max(1));
        Self {
            state: Mutex::new(Bucket {
                capacity: rpm,
                refill_per_sec: rpm / 60.0,
                tokens: rpm,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Reconfigure the limit. Takes effect for the next acquisition; when
    /// the bucket currently holds more tokens than the new capacity it is
    /// clamped down.
    pub async fn set_limit(&self, rpm: u32) {
        let rpm = f64::from(rpm.max(1));
        let mut bucket = self.state.lock().await;
        bucket.refill(Instant::now());
        bucket.capacity = rpm;
        bucket.refill_per_sec = rpm / 60.0;
        if bucket.tokens > bucket.capacity {
            bucket.tokens = bucket.capacity;
        }
    }

    /// Consume one token, waiting for refill when the bucket is empty.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut bucket = self.state.lock().await;
                bucket.refill(Instant::now());
                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    return;
                }
                Duration::from_secs_f64((1.0 - bucket.tokens) / bucket.refill_per_sec)
            };
            tokio::time::sleep(wait).await;
        }
    }

    /// Current token count (after refill). Diagnostic only.
    pub async fn available(&self) -> f64 {
        let mut bucket = self.state.lock().await;
        bucket.refill(Instant::now());
        bucket.tokens
    }
}
