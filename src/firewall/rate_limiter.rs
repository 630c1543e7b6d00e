//! Per-client token bucket rate limiting.
//!
//! Buckets refill continuously at `capacity / window` tokens per second and
//! are computed lazily on access, so idle clients cost nothing. Bucket state
//! is in-process only: losing it on restart fails open to full capacity.
//! Each bucket sits behind its own mutex so concurrent requests from the
//! same IP serialize their read-modify-write instead of racing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, RwLock};

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub allowed: bool,
    pub remaining: u64,
}

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_update: Instant,
}

pub struct RateLimiter {
    buckets: RwLock<HashMap<String, Arc<Mutex<TokenBucket>>>>,
    // Admissions since the last idle sweep
    since_sweep: AtomicU64,
}

/// Sweep the bucket map at most once per this many admissions.
const SWEEP_INTERVAL: u64 = 1024;

/// Refill a bucket's token count for `elapsed_secs` of wall time, capped at
/// capacity. Negative elapsed (clock skew) is clamped to zero.
fn refill(tokens: f64, elapsed_secs: f64, capacity: u64, window_secs: u64) -> f64 {
    let rate = capacity as f64 / window_secs.max(1) as f64;
    let elapsed = elapsed_secs.max(0.0);
    (tokens + elapsed * rate).min(capacity as f64)
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            buckets: RwLock::new(HashMap::new()),
            since_sweep: AtomicU64::new(0),
        }
    }

    /// Check whether a request from `client` is admitted under a bucket of
    /// `capacity` tokens refilling over `window_secs`. Consumes one token
    /// when admitted; rejects without consuming when fewer than one token
    /// remains. `remaining` is the floor of the post-consumption balance.
    pub async fn admit(&self, client: &str, capacity: u64, window_secs: u64) -> Admission {
        let entry = self.bucket_entry(client, capacity).await;
        let mut bucket = entry.lock().await;

        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_update).as_secs_f64();
        let tokens = refill(bucket.tokens, elapsed, capacity, window_secs);

        let admission = if tokens < 1.0 {
            // Rejected: leave the bucket untouched so the partial refill
            // keeps accruing against the old timestamp.
            Admission {
                allowed: false,
                remaining: 0,
            }
        } else {
            bucket.tokens = tokens - 1.0;
            bucket.last_update = now;
            Admission {
                allowed: true,
                remaining: bucket.tokens as u64,
            }
        };
        drop(bucket);

        if self.since_sweep.fetch_add(1, Ordering::Relaxed) + 1 >= SWEEP_INTERVAL {
            self.since_sweep.store(0, Ordering::Relaxed);
            self.sweep_idle(window_secs).await;
        }

        admission
    }

    /// Remaining quota for a client without consuming a token.
    pub async fn remaining(&self, client: &str, capacity: u64, window_secs: u64) -> u64 {
        let buckets = self.buckets.read().await;
        match buckets.get(client) {
            None => capacity,
            Some(entry) => {
                let bucket = entry.lock().await;
                let elapsed = bucket.last_update.elapsed().as_secs_f64();
                refill(bucket.tokens, elapsed, capacity, window_secs) as u64
            }
        }
    }

    /// Clear a client's bucket, restoring full capacity on next sight.
    pub async fn reset(&self, client: &str) {
        self.buckets.write().await.remove(client);
    }

    async fn bucket_entry(&self, client: &str, capacity: u64) -> Arc<Mutex<TokenBucket>> {
        {
            let buckets = self.buckets.read().await;
            if let Some(entry) = buckets.get(client) {
                return entry.clone();
            }
        }
        let mut buckets = self.buckets.write().await;
        buckets
            .entry(client.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(TokenBucket {
                    tokens: capacity as f64,
                    last_update: Instant::now(),
                }))
            })
            .clone()
    }

    /// Drop buckets idle for longer than twice the window.
    async fn sweep_idle(&self, window_secs: u64) {
        let ttl = (window_secs * 2).max(1) as f64;
        let mut buckets = self.buckets.write().await;
        let mut expired = Vec::new();
        for (client, entry) in buckets.iter() {
            if let Ok(bucket) = entry.try_lock() {
                if bucket.last_update.elapsed().as_secs_f64() > ttl {
                    expired.push(client.clone());
                }
            }
        }
        for client in expired {
            buckets.remove(&client);
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refill_is_proportional_to_elapsed_time() {
        // 100 tokens over 60s refills at 5/3 tokens per second
        let tokens = refill(0.0, 60.0, 100, 60);
        assert!((tokens - 100.0).abs() < 1e-9);

        let tokens = refill(0.0, 12.0, 5, 60);
        assert!((tokens - 1.0).abs() < 1e-9);
    }

    #[test]
    fn refill_is_capped_at_capacity() {
        let tokens = refill(90.0, 3600.0, 100, 60);
        assert!((tokens - 100.0).abs() < 1e-9);
    }

    #[test]
    fn refill_clamps_negative_elapsed() {
        // Clock skew must not drain the bucket
        let tokens = refill(40.0, -30.0, 100, 60);
        assert!((tokens - 40.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn first_request_from_new_client_is_admitted() {
        let limiter = RateLimiter::new();
        let admission = limiter.admit("192.168.1.1", 100, 60).await;
        assert!(admission.allowed);
        assert_eq!(admission.remaining, 99);
    }

    #[tokio::test]
    async fn consecutive_requests_each_consume_a_token() {
        let limiter = RateLimiter::new();
        let first = limiter.admit("192.168.1.1", 100, 60).await;
        let second = limiter.admit("192.168.1.1", 100, 60).await;
        assert_eq!(first.remaining, 99);
        assert_eq!(second.remaining, 98);
    }

    #[tokio::test]
    async fn rejects_beyond_capacity_with_no_idle_gap() {
        let limiter = RateLimiter::new();
        for i in 0..5 {
            let admission = limiter.admit("10.0.0.1", 5, 3600).await;
            assert!(admission.allowed, "request {i} should be admitted");
        }
        // Window is an hour, so effectively no refill between calls
        let admission = limiter.admit("10.0.0.1", 5, 3600).await;
        assert!(!admission.allowed);
        assert_eq!(admission.remaining, 0);
    }

    #[tokio::test]
    async fn clients_have_separate_buckets() {
        let limiter = RateLimiter::new();
        for _ in 0..2 {
            limiter.admit("10.0.0.1", 2, 3600).await;
        }
        assert!(!limiter.admit("10.0.0.1", 2, 3600).await.allowed);
        assert!(limiter.admit("10.0.0.2", 2, 3600).await.allowed);
    }

    #[tokio::test]
    async fn remaining_reports_full_capacity_for_unknown_client() {
        let limiter = RateLimiter::new();
        assert_eq!(limiter.remaining("10.9.9.9", 100, 60).await, 100);
    }

    #[tokio::test]
    async fn reset_restores_full_capacity() {
        let limiter = RateLimiter::new();
        for _ in 0..2 {
            limiter.admit("10.0.0.1", 2, 3600).await;
        }
        assert!(!limiter.admit("10.0.0.1", 2, 3600).await.allowed);
        limiter.reset("10.0.0.1").await;
        assert!(limiter.admit("10.0.0.1", 2, 3600).await.allowed);
    }

    #[tokio::test]
    async fn concurrent_admits_never_over_admit() {
        let limiter = Arc::new(RateLimiter::new());
        let mut handles = Vec::new();
        for _ in 0..20 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move {
                limiter.admit("172.16.0.1", 10, 3600).await.allowed
            }));
        }
        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 10);
    }

    #[tokio::test]
    async fn tokens_refill_after_waiting() {
        let limiter = RateLimiter::new();
        // Capacity 2 over a 1-second window: drain, then wait for refill
        assert!(limiter.admit("10.1.1.1", 2, 1).await.allowed);
        assert!(limiter.admit("10.1.1.1", 2, 1).await.allowed);
        assert!(!limiter.admit("10.1.1.1", 2, 1).await.allowed);
        tokio::time::sleep(std::time::Duration::from_millis(700)).await;
        assert!(limiter.admit("10.1.1.1", 2, 1).await.allowed);
    }
}
