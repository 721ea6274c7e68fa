//! Token bucket rate limiter for the global speed limit
//!
//! One limiter is shared by every HTTP transfer, so the configured limit
//! caps the sum of all active downloads rather than each one.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Largest slice taken from the bucket per call, keeps concurrent transfers fair
const MAX_ACQUIRE: u64 = 16 * 1024;

/// Longest single sleep, so a raised limit takes effect quickly
const MAX_WAIT: Duration = Duration::from_millis(50);

/// Shared token bucket; cloning shares the bucket
#[derive(Clone)]
pub struct RateLimiter {
    state: Arc<Mutex<BucketState>>,
}

struct BucketState {
    /// Bytes per second, 0 = unlimited
    limit: u64,
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    /// Create a limiter with `bytes_per_second`, 0 disables limiting
    pub fn new(bytes_per_second: u64) -> Self {
        Self {
            state: Arc::new(Mutex::new(BucketState {
                limit: bytes_per_second,
                tokens: bytes_per_second as f64,
                last_refill: Instant::now(),
            })),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(0)
    }

    pub fn limit(&self) -> u64 {
        self.state.lock().limit
    }

    /// Change the limit; in-flight waits pick it up on their next refill
    pub fn set_limit(&self, bytes_per_second: u64) {
        let mut state = self.state.lock();
        state.limit = bytes_per_second;
        state.tokens = state.tokens.min(bytes_per_second as f64);
        state.last_refill = Instant::now();
    }

    /// Wait until `bytes` may be written
    pub async fn acquire(&self, bytes: u64) {
        let mut remaining = bytes;
        while remaining > 0 {
            let wait = {
                let mut state = self.state.lock();
                if state.limit == 0 {
                    return;
                }
                // The bucket never holds more than one second of budget
                let wanted = remaining.min(MAX_ACQUIRE).min(state.limit);
                state.refill();
                if state.tokens >= wanted as f64 {
                    state.tokens -= wanted as f64;
                    remaining -= wanted;
                    continue;
                }
                let missing = wanted as f64 - state.tokens;
                Duration::from_secs_f64(missing / state.limit as f64).min(MAX_WAIT)
            };
            tokio::time::sleep(wait).await;
        }
    }
}

impl BucketState {
    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        // One second of burst at most
        self.tokens = (self.tokens + elapsed * self.limit as f64).min(self.limit as f64);
        self.last_refill = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rate_limiter_basic() {
        let limiter = RateLimiter::new(1000); // 1KB/s

        let start = Instant::now();
        limiter.acquire(500).await; // Should be immediate
        limiter.acquire(500).await; // Drains the initial burst
        assert!(start.elapsed().as_millis() < 50);

        limiter.acquire(500).await; // Should wait ~0.5s
        assert!(start.elapsed().as_millis() >= 400);
    }

    #[tokio::test]
    async fn test_acquire_larger_than_limit() {
        let limiter = RateLimiter::new(1000);
        limiter.acquire(1000).await;

        let start = Instant::now();
        tokio::time::timeout(Duration::from_secs(4), limiter.acquire(2000))
            .await
            .expect("a chunk above the limit is paced, not stuck");
        // Two seconds of budget, minus timer slack
        assert!(start.elapsed().as_millis() >= 1500);
    }

    #[tokio::test]
    async fn test_rate_limiter_unlimited() {
        let limiter = RateLimiter::unlimited();

        let start = Instant::now();
        for _ in 0..100 {
            limiter.acquire(1024 * 1024).await;
        }
        assert!(start.elapsed().as_millis() < 50);
    }

    #[tokio::test]
    async fn test_lifting_limit_releases_waiters() {
        let limiter = RateLimiter::new(100);
        limiter.acquire(100).await;

        let waiter = limiter.clone();
        let handle = tokio::spawn(async move { waiter.acquire(10_000).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        limiter.set_limit(0);

        tokio::time::timeout(Duration::from_millis(500), handle)
            .await
            .expect("waiter should finish once unlimited")
            .unwrap();
    }
}
