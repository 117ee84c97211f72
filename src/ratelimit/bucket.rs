//! Token bucket implementation.

use parking_lot::Mutex;
use std::time::Instant;

/// Mutable part of a bucket, always read and written under one lock.
#[derive(Debug)]
struct BucketState {
    /// Tokens currently available, `0.0 ..= capacity`
    tokens: f64,
    /// When `tokens` was last brought up to date
    last_refill: Instant,
}

/// A token bucket: up to `capacity` tokens, refilled continuously at
/// `refill_rate` tokens per second, one token per admitted request.
///
/// `allow` does the refill and the conditional take in a single critical
/// section, so concurrent callers on the same bucket can never both spend
/// the last token.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    refill_rate: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Create a full bucket.
    ///
    /// A `refill_rate` of zero yields a bucket that serves its initial burst
    /// and then rejects forever.
    pub fn new(capacity: u32, refill_rate: f64, now: Instant) -> Self {
        let capacity = f64::from(capacity);
        Self {
            capacity,
            refill_rate,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: now,
            }),
        }
    }

    /// Refill for the time elapsed up to `now`, then take one token if a
    /// whole one is available.
    ///
    /// Returns `true` if the request may proceed. Never blocks beyond the
    /// bucket's own lock.
    pub fn allow(&self, now: Instant) -> bool {
        let mut state = self.state.lock();

        // A caller holding an older `now` than the last refill adds nothing.
        let elapsed = now.saturating_duration_since(state.last_refill);
        if !elapsed.is_zero() {
            let refilled = state.tokens + elapsed.as_secs_f64() * self.refill_rate;
            state.tokens = refilled.min(self.capacity);
            state.last_refill = now;
        }

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Tokens available as of the last `allow` call.
    pub fn tokens(&self) -> f64 {
        self.state.lock().tokens
    }

    /// Maximum number of tokens (the burst size).
    pub fn capacity(&self) -> u32 {
        self.capacity as u32
    }

    /// Tokens added per second.
    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }
}
