//! Token-bucket throttle for calls to the downstream system.
//!
//! Continuous refill based on elapsed time, so sustained throughput follows
//! the refill rate while short bursts may drain up to `capacity` tokens.
//!
//! One instance is shared by all workers in a process (inject the `Arc`, do
//! not reach for a global). Cross-process sharing is out of scope: running
//! several worker processes multiplies the effective rate toward the
//! downstream system.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

/// Default sustained rate: ~10 ops/sec (600/min), matching the downstream
/// system's published limits.
pub const DEFAULT_REFILL_PER_SEC: f64 = 10.0;
/// Default burst capacity.
pub const DEFAULT_CAPACITY: u32 = 10;

#[derive(Debug)]
struct Bucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl Bucket {
    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
            self.last_refill = now;
        }
    }

    /// Take one token, or report how long until one is available.
    fn try_take(&mut self, now: Instant) -> Result<(), Duration> {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            let deficit = 1.0 - self.tokens;
            Err(Duration::from_secs_f64(deficit / self.refill_per_sec))
        }
    }
}

/// Shared throttle bounding how fast workers may call the external system.
#[derive(Debug)]
pub struct RateLimiter {
    bucket: Mutex<Bucket>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_REFILL_PER_SEC)
    }
}

impl RateLimiter {
    /// `capacity` tokens of burst, refilled at `refill_per_sec`.
    pub fn new(capacity: u32, refill_per_sec: f64) -> Self {
        let capacity = f64::from(capacity.max(1));
        Self {
            bucket: Mutex::new(Bucket {
                capacity,
                tokens: capacity,
                refill_per_sec: refill_per_sec.max(f64::MIN_POSITIVE),
                last_refill: Instant::now(),
            }),
        }
    }

    /// Suspend until a token is available, then consume it.
    ///
    /// Release order is FIFO-ish: waiters queue on the internal mutex, no
    /// stronger fairness guarantee is made.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut bucket = self.bucket.lock().await;
                match bucket.try_take(Instant::now()) {
                    Ok(()) => return,
                    Err(wait) => wait,
                }
            };
            tokio::time::sleep(wait).await;
        }
    }

    /// Tokens currently available (after refill). Diagnostic only.
    pub async fn available(&self) -> u32 {
        let mut bucket = self.bucket.lock().await;
        bucket.refill(Instant::now());
        bucket.tokens as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn burst_up_to_capacity_is_immediate() {
        let limiter = RateLimiter::new(3, 10.0);
        let start = Instant::now();
        for _ in 0..3 {
            limiter.acquire().await;
        }
        assert!(start.elapsed() < Duration::from_millis(1));
        assert_eq!(limiter.available().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_waits_for_refill_once_drained() {
        let limiter = RateLimiter::new(1, 10.0);
        limiter.acquire().await;

        let start = Instant::now();
        limiter.acquire().await;
        // 10 tokens/sec: next token ~100ms out.
        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(90), "waited {waited:?}");
        assert!(waited <= Duration::from_millis(200), "waited {waited:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn tokens_do_not_accumulate_beyond_capacity() {
        let limiter = RateLimiter::new(2, 10.0);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(limiter.available().await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn sustained_rate_follows_refill() {
        let limiter = RateLimiter::new(1, 10.0);
        let start = Instant::now();
        for _ in 0..11 {
            limiter.acquire().await;
        }
        // First is burst; the remaining ten each wait ~100ms.
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(950), "elapsed {elapsed:?}");
    }
}
