//! Token bucket implementation.

use parking_lot::Mutex;
use std::time::Instant;

use super::rules::BucketParams;

/// Mutable part of a bucket, guarded by the bucket's own lock.
#[derive(Debug)]
struct BucketState {
    /// Tokens currently available
    tokens: f64,
    /// When the bucket was last refilled
    last_refill: Instant,
}

/// A token bucket with continuous refill.
///
/// Each bucket carries its own lock, so contention on one key never blocks
/// decisions for other keys. `0 <= tokens <= capacity` holds at all times.
#[derive(Debug)]
pub struct TokenBucket {
    params: BucketParams,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Create a full bucket.
    pub fn new(params: BucketParams, now: Instant) -> Self {
        Self {
            params,
            state: Mutex::new(BucketState {
                tokens: params.capacity,
                last_refill: now,
            }),
        }
    }

    /// Refill for the time elapsed since the last call, then take `cost`
    /// tokens if that many are available.
    ///
    /// Returns `true` if the tokens were taken. A denied call leaves the
    /// token count untouched. A negative or non-finite `cost` is always
    /// denied.
    pub fn try_consume(&self, now: Instant, cost: f64) -> bool {
        let mut state = self.state.lock();

        // A caller holding an older instant must not move the clock back.
        if now > state.last_refill {
            let elapsed = now.duration_since(state.last_refill).as_secs_f64();
            state.tokens =
                (state.tokens + elapsed * self.params.refill_per_second).min(self.params.capacity);
            state.last_refill = now;
        }

        if cost.is_finite() && cost >= 0.0 && state.tokens >= cost {
            state.tokens -= cost;
            true
        } else {
            false
        }
    }

    /// Tokens available as of the last refill.
    pub fn tokens(&self) -> f64 {
        self.state.lock().tokens
    }

    pub fn params(&self) -> BucketParams {
        self.params
    }
}
