//! Per-connection inbound rate limiting.
//!
//! Each connection's inbound pump owns one token bucket. Ownership
//! replaces the locking a shared limiter would need; nothing else ever
//! touches it.

use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Rate limit knobs for inbound traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Steady-state messages per second.
    pub max_per_second: u32,
    /// Bucket capacity; admits short bursts above the steady rate.
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_per_second: 10,
            burst: 20,
        }
    }
}

/// Floating point token bucket.
///
/// Tokens refill continuously in proportion to elapsed time, so
/// fractional amounts accumulate across calls and a partially refilled
/// bucket eventually admits another message without ever exceeding the
/// configured burst.
#[derive(Debug)]
pub struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Create a bucket that starts full.
    #[must_use]
    pub fn new(capacity: f64, refill_per_sec: f64) -> Self {
        Self {
            tokens: capacity,
            capacity,
            refill_per_sec,
            last_refill: Instant::now(),
        }
    }

    /// Create a bucket from the hub's configured limits.
    #[must_use]
    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(f64::from(config.burst), f64::from(config.max_per_second))
    }

    /// Admit one message if a whole token is available.
    pub fn allow(&mut self) -> bool {
        self.refill();

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();

        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
            self.last_refill = now;
        }
    }

    /// Tokens currently available.
    #[must_use]
    pub fn available(&self) -> f64 {
        self.tokens
    }
}
