//! Token-bucket rate limiter with a concurrency semaphore.
//!
//! Corresponds to spec §4.7. Buckets are refilled lazily on every consume
//! using `min(capacity, tokens + elapsed_ms * refill_rate)`; `acquire`
//! blocks until both admission and the concurrency semaphore succeed,
//! with FIFO fairness among waiters (delegated to `tokio::sync::Semaphore`,
//! which queues acquirers in arrival order).

use parking_lot::Mutex;
use std::time::Instant;
use tokio::sync::Semaphore;

/// A single token bucket: `capacity` tokens, refilled at `refill_rate`
/// tokens/ms.
struct Bucket {
    capacity: f64,
    refill_rate: f64,
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn new(capacity: f64, window_ms: f64) -> Self {
        Self {
            capacity,
            refill_rate: capacity / window_ms,
            tokens: capacity,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed_ms = now.duration_since(self.last_refill).as_secs_f64() * 1000.0;
        self.tokens = (self.tokens + elapsed_ms * self.refill_rate).min(self.capacity);
        self.last_refill = now;
    }

    /// Try to consume `n` tokens. Returns `Ok(())` on success, or the
    /// number of milliseconds to wait before retrying.
    fn try_consume(&mut self, n: f64) -> Result<(), u64> {
        self.refill();
        if self.tokens >= n {
            self.tokens -= n;
            Ok(())
        } else {
            let deficit = n - self.tokens;
            let wait_ms = (deficit / self.refill_rate).ceil() as u64;
            Err(wait_ms)
        }
    }

    fn refund(&mut self, n: f64) {
        self.tokens = (self.tokens + n).min(self.capacity);
    }
}

/// Configuration for the rate limiter's bucket sizes.
///
/// Corresponds to the `rate_limit.{rpm,rph,tpm,tph,concurrent}` table in
/// spec §6.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    pub requests_per_minute: Option<u32>,
    pub requests_per_hour: Option<u32>,
    pub tokens_per_minute: Option<u32>,
    pub tokens_per_hour: Option<u32>,
    pub concurrent_requests: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: None,
            requests_per_hour: None,
            tokens_per_minute: None,
            tokens_per_hour: None,
            concurrent_requests: 4,
        }
    }
}

const MINUTE_MS: f64 = 60_000.0;
const HOUR_MS: f64 = 3_600_000.0;

struct Buckets {
    rpm: Option<Bucket>,
    rph: Option<Bucket>,
    tpm: Option<Bucket>,
    tph: Option<Bucket>,
}

/// A request/token admission result: either admitted, or a hint of how
/// long to wait before retrying.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Admission {
    Admitted,
    Wait { wait_ms: u64 },
}

pub struct RateLimiter {
    buckets: Mutex<Buckets>,
    semaphore: Semaphore,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            buckets: Mutex::new(Buckets {
                rpm: config.requests_per_minute.map(|c| Bucket::new(c as f64, MINUTE_MS)),
                rph: config.requests_per_hour.map(|c| Bucket::new(c as f64, HOUR_MS)),
                tpm: config.tokens_per_minute.map(|c| Bucket::new(c as f64, MINUTE_MS)),
                tph: config.tokens_per_hour.map(|c| Bucket::new(c as f64, HOUR_MS)),
            }),
            semaphore: Semaphore::new(config.concurrent_requests.max(1)),
        }
    }

    /// Attempt to consume one request-token from both RPM and RPH.
    ///
    /// Corresponds to spec §4.7's `check_request`: if either bucket
    /// refuses, both are rolled back.
    pub fn check_request(&self) -> Admission {
        let mut buckets = self.buckets.lock();
        let rpm_result = buckets.rpm.as_mut().map(|b| b.try_consume(1.0));
        if let Some(Err(wait_ms)) = rpm_result {
            return Admission::Wait { wait_ms };
        }
        let rph_result = buckets.rph.as_mut().map(|b| b.try_consume(1.0));
        if let Some(Err(wait_ms)) = rph_result {
            if let Some(rpm) = buckets.rpm.as_mut() {
                rpm.refund(1.0);
            }
            return Admission::Wait { wait_ms };
        }
        Admission::Admitted
    }

    /// Attempt to consume `n` tokens from both TPM and TPH.
    pub fn check_tokens(&self, n: u64) -> Admission {
        let n = n as f64;
        let mut buckets = self.buckets.lock();
        let tpm_result = buckets.tpm.as_mut().map(|b| b.try_consume(n));
        if let Some(Err(wait_ms)) = tpm_result {
            return Admission::Wait { wait_ms };
        }
        let tph_result = buckets.tph.as_mut().map(|b| b.try_consume(n));
        if let Some(Err(wait_ms)) = tph_result {
            if let Some(tpm) = buckets.tpm.as_mut() {
                tpm.refund(n);
            }
            return Admission::Wait { wait_ms };
        }
        Admission::Admitted
    }

    /// Block until request admission succeeds *and* a concurrency permit
    /// is available. FIFO among waiters via the underlying semaphore.
    ///
    /// Corresponds to spec §4.7's `acquire()`.
    pub async fn acquire(&self) -> RateLimitPermit<'_> {
        loop {
            match self.check_request() {
                Admission::Admitted => break,
                Admission::Wait { wait_ms } => {
                    tokio::time::sleep(std::time::Duration::from_millis(wait_ms)).await;
                }
            }
        }
        let permit = self
            .semaphore
            .acquire()
            .await
            .expect("rate limiter semaphore never closed");
        RateLimitPermit { _permit: permit }
    }

    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }
}

/// RAII guard returned by `acquire`; releasing is automatic on drop,
/// corresponding to spec §4.7's `release()`.
pub struct RateLimitPermit<'a> {
    _permit: tokio::sync::SemaphorePermit<'a>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_admits_up_to_capacity_then_refuses() {
        let mut bucket = Bucket::new(3.0, MINUTE_MS);
        assert!(bucket.try_consume(1.0).is_ok());
        assert!(bucket.try_consume(1.0).is_ok());
        assert!(bucket.try_consume(1.0).is_ok());
        assert!(bucket.try_consume(1.0).is_err());
    }

    #[test]
    fn check_request_rolls_back_on_rph_refusal() {
        let limiter = RateLimiter::new(RateLimitConfig {
            requests_per_minute: Some(100),
            requests_per_hour: Some(1),
            tokens_per_minute: None,
            tokens_per_hour: None,
            concurrent_requests: 4,
        });
        assert_eq!(limiter.check_request(), Admission::Admitted);
        // RPH exhausted; RPM should have been refunded, not leaked.
        match limiter.check_request() {
            Admission::Wait { .. } => {}
            Admission::Admitted => panic!("expected refusal from rph"),
        }
        let buckets = limiter.buckets.lock();
        let rpm_tokens = buckets.rpm.as_ref().unwrap().tokens;
        assert!(rpm_tokens >= 98.0, "rpm should have been refunded: {rpm_tokens}");
    }

    #[tokio::test]
    async fn concurrency_semaphore_bounds_in_flight() {
        let limiter = RateLimiter::new(RateLimitConfig {
            concurrent_requests: 1,
            ..RateLimitConfig::default()
        });
        let _permit = limiter.acquire().await;
        assert_eq!(limiter.available_permits(), 0);
        drop(_permit);
        assert_eq!(limiter.available_permits(), 1);
    }
}
