use std::sync::Mutex;
use std::time::{Duration, Instant};

use scrapeflow_core::config::RateLimiterConfig;
use scrapeflow_core::traits::RateLimiter;
use scrapeflow_core::types::Admission;

/// Token bucket shared by every execution in the process.
pub struct TokenBucket {
    rate: f64,
    capacity: f64,
    state: Mutex<Bucket>,
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// A full bucket refilled at `requests_per_second`, holding at most `burst_size`.
    pub fn new(requests_per_second: f64, burst_size: u32) -> Self {
        let capacity = f64::from(burst_size.max(1));
        Self {
            rate: requests_per_second.max(f64::EPSILON),
            capacity,
            state: Mutex::new(Bucket {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn from_config(config: &RateLimiterConfig) -> Self {
        Self::new(config.requests_per_second, config.burst_size)
    }
}

impl RateLimiter for TokenBucket {
    fn admit(&self, cost: u32) -> Admission {
        // A cost above capacity could never be granted; charge a full bucket instead
        let cost = f64::from(cost.max(1)).min(self.capacity);
        let mut bucket = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate).min(self.capacity);
        bucket.last_refill = now;

        if bucket.tokens >= cost {
            bucket.tokens -= cost;
            Admission::Granted
        } else {
            let missing = cost - bucket.tokens;
            Admission::Denied {
                retry_after: Duration::from_secs_f64(missing / self.rate),
            }
        }
    }
}
