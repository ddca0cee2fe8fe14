use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{Instant, sleep};

// absorbs float drift after sleeping exactly the computed refill time
const TOKEN_EPSILON: f64 = 1e-9;

#[derive(Clone)]
pub struct RateLimiter {
    rate_per_second: f64,
    burst: f64,
    bucket: Option<Arc<Mutex<Bucket>>>,
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    // zero interval disables limiting
    pub fn new(interval: Duration, burst: u64) -> Self {
        if interval.is_zero() {
            return Self::disabled();
        }
        let burst = burst.max(1) as f64;
        Self {
            rate_per_second: 1.0 / interval.as_secs_f64(),
            burst,
            bucket: Some(Arc::new(Mutex::new(Bucket {
                tokens: burst,
                last_refill: Instant::now(),
            }))),
        }
    }

    pub fn disabled() -> Self {
        Self {
            rate_per_second: 0.0,
            burst: 0.0,
            bucket: None,
        }
    }

    pub fn enabled(&self) -> bool {
        self.bucket.is_some()
    }

    pub async fn acquire(&self) {
        let Some(bucket) = self.bucket.as_ref() else {
            return;
        };
        loop {
            let wait = {
                let mut bucket = bucket.lock().await;
                let now = Instant::now();
                let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
                bucket.tokens = (bucket.tokens + elapsed * self.rate_per_second).min(self.burst);
                bucket.last_refill = now;
                if bucket.tokens >= 1.0 - TOKEN_EPSILON {
                    bucket.tokens = (bucket.tokens - 1.0).max(0.0);
                    return;
                }
                Duration::from_secs_f64((1.0 - bucket.tokens) / self.rate_per_second)
            };
            sleep(wait).await;
        }
    }
}
