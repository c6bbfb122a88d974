//! Byte-per-second caps for the data plane.
//!
//! A token bucket per direction, shared by every session. When the
//! rolling budget is spent, the next send or recv on that socket waits.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::time::sleep;

#[derive(Debug)]
struct Bucket {
    /// Bytes per second; zero means unlimited.
    rate: u64,
    available: f64,
    refilled: Instant,
}

/// Shared between sessions via `Arc`.
#[derive(Debug)]
pub struct RateLimiter {
    bucket: Mutex<Bucket>,
}

/// Never accumulate more than a second of burst.
const BURST_SECS: f64 = 1.0;

impl RateLimiter {
    pub fn new(bytes_per_sec: u64) -> Self {
        Self {
            bucket: Mutex::new(Bucket {
                rate: bytes_per_sec,
                available: bytes_per_sec as f64,
                refilled: Instant::now(),
            }),
        }
    }

    pub fn set_rate(&self, bytes_per_sec: u64) {
        let mut bucket = self.bucket.lock().unwrap();
        bucket.rate = bytes_per_sec;
        bucket.available = bucket.available.min(bytes_per_sec as f64);
    }

    pub fn rate(&self) -> u64 {
        self.bucket.lock().unwrap().rate
    }

    /// Account for `n` bytes, sleeping until the budget allows them.
    pub async fn throttle(&self, n: usize) {
        loop {
            let wait = {
                let mut bucket = self.bucket.lock().unwrap();
                if bucket.rate == 0 {
                    return;
                }
                let now = Instant::now();
                let elapsed = now.duration_since(bucket.refilled).as_secs_f64();
                bucket.refilled = now;
                bucket.available = (bucket.available + elapsed * bucket.rate as f64)
                    .min(bucket.rate as f64 * BURST_SECS);

                if bucket.available >= n as f64 {
                    bucket.available -= n as f64;
                    return;
                }
                // Sleep until the deficit refills.
                let deficit = n as f64 - bucket.available;
                Duration::from_secs_f64(deficit / bucket.rate as f64)
            };
            sleep(wait).await;
        }
    }
}
