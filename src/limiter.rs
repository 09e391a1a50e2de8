//! Token-bucket rate limiting for exchange REST endpoints.
//!
//! One bucket guards each exchange endpoint family; the snapshotter and the
//! lifecycle manager share it so stacked request storms cannot form.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Classic token bucket: `rate_per_sec` sustained, `burst` capacity.
#[derive(Debug)]
pub struct TokenBucket {
    rate_per_sec: f64,
    burst: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(rate_per_sec: f64, burst: f64) -> Self {
        let rate_per_sec = rate_per_sec.max(0.001);
        let burst = burst.max(1.0);
        Self {
            rate_per_sec,
            burst,
            state: Mutex::new(BucketState {
                tokens: burst,
                last_refill: Instant::now(),
            }),
        }
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate_per_sec).min(self.burst);
        state.last_refill = now;
    }

    fn try_acquire_at(&self, now: Instant) -> Result<(), Duration> {
        let mut state = self.state.lock();
        self.refill(&mut state, now);
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            Ok(())
        } else {
            let deficit = 1.0 - state.tokens;
            Err(Duration::from_secs_f64(deficit / self.rate_per_sec))
        }
    }

    pub fn try_acquire(&self) -> bool {
        self.try_acquire_at(Instant::now()).is_ok()
    }

    /// Wait for one token. The wait is a plain sleep, so callers that need
    /// cancellation select this future against their shutdown token.
    pub async fn acquire(&self) {
        loop {
            match self.try_acquire_at(Instant::now()) {
                Ok(()) => return,
                Err(wait) => tokio::time::sleep(wait.max(Duration::from_millis(5))).await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_drains_then_blocks() {
        let bucket = TokenBucket::new(10.0, 3.0);
        let t0 = Instant::now();
        assert!(bucket.try_acquire_at(t0).is_ok());
        assert!(bucket.try_acquire_at(t0).is_ok());
        assert!(bucket.try_acquire_at(t0).is_ok());
        assert!(bucket.try_acquire_at(t0).is_err());
    }

    #[test]
    fn refills_at_configured_rate() {
        let bucket = TokenBucket::new(10.0, 1.0);
        let t0 = Instant::now();
        assert!(bucket.try_acquire_at(t0).is_ok());
        assert!(bucket.try_acquire_at(t0).is_err());
        // 10 rps -> one token back after 100ms.
        assert!(bucket
            .try_acquire_at(t0 + Duration::from_millis(110))
            .is_ok());
    }

    #[test]
    fn tokens_cap_at_burst() {
        let bucket = TokenBucket::new(100.0, 2.0);
        let t0 = Instant::now();
        // A long idle period must not accumulate more than `burst` tokens.
        let later = t0 + Duration::from_secs(60);
        assert!(bucket.try_acquire_at(later).is_ok());
        assert!(bucket.try_acquire_at(later).is_ok());
        assert!(bucket.try_acquire_at(later).is_err());
    }

    #[test]
    fn reports_time_until_next_token() {
        let bucket = TokenBucket::new(2.0, 1.0);
        let t0 = Instant::now();
        assert!(bucket.try_acquire_at(t0).is_ok());
        let wait = bucket.try_acquire_at(t0).unwrap_err();
        // 2 rps -> next token in ~500ms.
        assert!(wait >= Duration::from_millis(400) && wait <= Duration::from_millis(600));
    }
}
