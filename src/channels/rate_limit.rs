//! Outbound Rate Limiting
//!
//! A single token bucket shared by every outbound send.
//!
//! Features:
//! - Burst capacity with continuous refill
//! - Blocking `acquire` (senders wait, nothing is dropped)
//! - Non-blocking `try_acquire` for probes and tests

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Rate limiter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Bucket capacity (maximum burst of sends)
    pub burst: u32,
    /// Tokens added per second
    pub refill_per_sec: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            burst: 10,          // 10 back-to-back replies
            refill_per_sec: 1.0, // then one per second
        }
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn refill(&mut self, capacity: f64, rate: f64) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate).min(capacity);
        self.last_refill = now;
    }
}

/// Token bucket gating outbound throughput
pub struct TokenBucket {
    capacity: f64,
    rate: f64,
    bucket: Mutex<Bucket>,
    waits: AtomicU64,
}

impl TokenBucket {
    /// Create a full bucket
    pub fn new(config: &RateLimitConfig) -> Self {
        let capacity = config.burst.max(1) as f64;
        let rate = if config.refill_per_sec > 0.0 {
            config.refill_per_sec
        } else {
            warn!(
                "Invalid refill rate {}, falling back to 1 token/sec",
                config.refill_per_sec
            );
            1.0
        };

        Self {
            capacity,
            rate,
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
            waits: AtomicU64::new(0),
        }
    }

    /// Take a token without waiting
    pub fn try_acquire(&self) -> bool {
        let mut bucket = self.bucket.lock();
        bucket.refill(self.capacity, self.rate);
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Wait until a token is available, then take it
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut bucket = self.bucket.lock();
                bucket.refill(self.capacity, self.rate);
                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    return;
                }
                Duration::from_secs_f64((1.0 - bucket.tokens) / self.rate)
            };

            self.waits.fetch_add(1, Ordering::Relaxed);
            debug!("Outbound bucket empty, waiting {:?}", wait);
            tokio::time::sleep(wait).await;
        }
    }

    /// Current statistics
    pub fn stats(&self) -> RateLimitStats {
        let mut bucket = self.bucket.lock();
        bucket.refill(self.capacity, self.rate);
        RateLimitStats {
            available_tokens: bucket.tokens,
            capacity: self.capacity,
            refill_per_sec: self.rate,
            waits: self.waits.load(Ordering::Relaxed),
        }
    }
}

/// Rate limit statistics
#[derive(Debug, Clone)]
pub struct RateLimitStats {
    pub available_tokens: f64,
    pub capacity: f64,
    pub refill_per_sec: f64,
    /// Number of times a sender had to wait
    pub waits: u64,
}
