//! Rate limiting.
//!
//! The engine treats the rate limiter as an outer admission layer: before
//! submitting a send or receive to the dispatcher it asks whether the
//! transfer would exceed the configured bandwidth, and if so applies flow
//! control and schedules a timer for the instant the limiter will accept
//! the transfer again.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Byte-bandwidth admission control.
///
/// Implementations are shared across the submit path and timer callbacks
/// via `Arc`, so all methods take `&self` and use interior mutability.
pub trait RateLimiter: Send + Sync {
    /// Whether submitting now would exceed the configured bandwidth.
    fn would_exceed_bandwidth(&self, now: Instant) -> bool;

    /// How long from `now` until a submission will be admitted.
    fn time_to_submit(&self, now: Instant) -> Duration;

    /// Record `bytes` as transferred at `now`.
    fn submit(&self, now: Instant, bytes: u64);
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    refreshed: Instant,
}

/// A deterministic token bucket.
///
/// Tokens accrue at `rate` bytes per second up to `capacity`; each
/// submission spends its byte count. The clock is always passed in, so
/// tests can drive the bucket without sleeping.
#[derive(Debug)]
pub struct TokenBucket {
    rate: f64,
    capacity: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Create a bucket admitting `rate` bytes per second with a burst
    /// capacity of `capacity` bytes, full at `origin`.
    ///
    /// # Panics
    ///
    /// Panics if `rate` is zero.
    #[must_use]
    pub fn new(rate: u64, capacity: u64, origin: Instant) -> Self {
        assert!(rate > 0, "rate must be positive");
        Self {
            rate: rate as f64,
            capacity: capacity as f64,
            state: Mutex::new(BucketState {
                tokens: capacity as f64,
                refreshed: origin,
            }),
        }
    }

    fn refresh(&self, state: &mut BucketState, now: Instant) {
        if now <= state.refreshed {
            return;
        }
        let elapsed = now.duration_since(state.refreshed).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate).min(self.capacity);
        state.refreshed = now;
    }
}

impl RateLimiter for TokenBucket {
    fn would_exceed_bandwidth(&self, now: Instant) -> bool {
        let mut state = self.state.lock();
        self.refresh(&mut state, now);
        state.tokens < 0.0
    }

    fn time_to_submit(&self, now: Instant) -> Duration {
        let mut state = self.state.lock();
        self.refresh(&mut state, now);
        if state.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-state.tokens / self.rate)
        }
    }

    fn submit(&self, now: Instant, bytes: u64) {
        let mut state = self.state.lock();
        self.refresh(&mut state, now);
        // The debt may go negative; admission stays closed until refills
        // bring the balance back above zero.
        state.tokens -= bytes as f64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admits_until_capacity_spent() {
        let origin = Instant::now();
        let bucket = TokenBucket::new(1000, 1000, origin);

        assert!(!bucket.would_exceed_bandwidth(origin));
        bucket.submit(origin, 600);
        assert!(!bucket.would_exceed_bandwidth(origin));
        bucket.submit(origin, 600);

        // 1200 bytes spent against a 1000-byte balance.
        assert!(bucket.would_exceed_bandwidth(origin));
    }

    #[test]
    fn test_time_to_submit_matches_debt() {
        let origin = Instant::now();
        let bucket = TokenBucket::new(1000, 1000, origin);

        bucket.submit(origin, 1500);
        let wait = bucket.time_to_submit(origin);

        // 500 bytes of debt at 1000 bytes per second.
        assert!(wait >= Duration::from_millis(499));
        assert!(wait <= Duration::from_millis(501));
    }

    #[test]
    fn test_refill_restores_admission() {
        let origin = Instant::now();
        let bucket = TokenBucket::new(1000, 1000, origin);

        bucket.submit(origin, 1500);
        assert!(bucket.would_exceed_bandwidth(origin));

        let later = origin + Duration::from_secs(1);
        assert!(!bucket.would_exceed_bandwidth(later));
        assert_eq!(bucket.time_to_submit(later), Duration::ZERO);
    }

    #[test]
    fn test_capacity_caps_refill() {
        let origin = Instant::now();
        let bucket = TokenBucket::new(1000, 500, origin);

        let much_later = origin + Duration::from_secs(60);
        bucket.submit(much_later, 400);
        assert!(!bucket.would_exceed_bandwidth(much_later));
        bucket.submit(much_later, 400);
        assert!(bucket.would_exceed_bandwidth(much_later));
    }
}
