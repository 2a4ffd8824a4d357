//! Process-wide token-bucket rate limiter.
//!
//! One bucket per provider prefix, shared by every run in the process.
//! `acquire` waits until a token is available; it never fails.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use crate::config::OrchestratorSettings;

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

#[derive(Debug)]
pub struct RateLimiter {
    capacity: f64,
    refill_per_sec: f64,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl RateLimiter {
    /// Creates a limiter whose buckets hold `capacity` tokens and regain
    /// `refill_per_sec` tokens per second. Buckets start full.
    pub fn new(capacity: u32, refill_per_sec: f64) -> Self {
        Self {
            capacity: capacity.max(1) as f64,
            refill_per_sec: if refill_per_sec > 0.0 { refill_per_sec } else { 1.0 },
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_settings(settings: &OrchestratorSettings) -> Self {
        Self::new(settings.rate_limit_capacity, settings.rate_limit_refill_per_sec)
    }

    /// Takes a token if one is available, otherwise returns how long until
    /// the next one is.
    fn try_take(&self, provider: &str) -> Result<(), Duration> {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        let bucket = buckets.entry(provider.to_string()).or_insert(Bucket {
            tokens: self.capacity,
            last_refill: now,
        });

        let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(())
        } else {
            let missing = 1.0 - bucket.tokens;
            Err(Duration::from_secs_f64(missing / self.refill_per_sec))
        }
    }

    /// Waits for a token for `provider` and returns how long that took.
    pub async fn acquire(&self, provider: &str) -> Duration {
        let started = Instant::now();
        loop {
            match self.try_take(provider) {
                Ok(()) => return started.elapsed(),
                Err(wait) => {
                    tracing::debug!(
                        provider = provider,
                        wait_ms = wait.as_millis() as u64,
                        "Rate limit reached, waiting for token"
                    );
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    /// Tokens currently available for `provider`, without refilling.
    pub fn available(&self, provider: &str) -> f64 {
        let buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        buckets
            .get(provider)
            .map(|b| b.tokens)
            .unwrap_or(self.capacity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_burst_then_blocks_until_refill() {
        let limiter = RateLimiter::new(2, 1.0);

        assert_eq!(limiter.acquire("openai").await, Duration::ZERO);
        assert_eq!(limiter.acquire("openai").await, Duration::ZERO);

        let waited = limiter.acquire("openai").await;
        assert!(waited >= Duration::from_millis(999), "waited {:?}", waited);
        assert!(waited <= Duration::from_millis(1100), "waited {:?}", waited);
    }

    #[tokio::test(start_paused = true)]
    async fn test_buckets_are_per_provider() {
        let limiter = RateLimiter::new(1, 0.5);
        limiter.acquire("openai").await;
        assert_eq!(limiter.acquire("anthropic").await, Duration::ZERO);
        assert!(limiter.available("openai") < 1.0);
        assert!((limiter.available("unused") - 1.0).abs() < f64::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shared_limiter_paces_concurrent_callers() {
        let limiter = Arc::new(RateLimiter::new(1, 10.0));
        let start = Instant::now();

        let handles: Vec<_> = (0..5)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move { limiter.acquire("p").await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        // One token up front, then four more at 10 per second.
        assert!(start.elapsed() >= Duration::from_millis(399));
    }

    #[test]
    fn test_degenerate_settings_are_clamped() {
        let limiter = RateLimiter::new(0, 0.0);
        assert!((limiter.available("x") - 1.0).abs() < f64::EPSILON);
    }
}
