//! Rate Limiting
//!
//! Token bucket rate limiter for preventing abuse. Each limiter instance
//! covers one window (for example "5 requests per minute"); the HTTP edge
//! keeps one instance per route group, keyed by client address.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

/// Token bucket for rate limiting a single client.
#[derive(Debug)]
struct TokenBucket {
    /// Current number of tokens.
    tokens: f64,
    /// Maximum tokens (bucket capacity).
    max_tokens: f64,
    /// Tokens added per second.
    refill_rate: f64,
    /// Last time tokens were updated.
    last_update: Instant,
}

impl TokenBucket {
    fn new(max_tokens: u32, refill_rate: f64) -> Self {
        TokenBucket {
            tokens: max_tokens as f64,
            max_tokens: max_tokens as f64,
            refill_rate,
            last_update: Instant::now(),
        }
    }

    /// Refills tokens based on elapsed time.
    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.max_tokens);
        self.last_update = now;
    }

    /// Tries to consume one token.
    ///
    /// Returns true if successful, false if rate limited.
    fn try_consume(&mut self) -> bool {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Rate limiter for multiple clients over one window.
pub struct RateLimiter {
    /// Per-client token buckets.
    buckets: RwLock<HashMap<String, TokenBucket>>,
    /// Maximum requests per window.
    max_requests: u32,
    /// Window the maximum applies to.
    window: Duration,
}

impl RateLimiter {
    /// Creates a limiter allowing `max_requests` per `window` per client.
    pub fn new(max_requests: u32, window: Duration) -> Self {
        RateLimiter {
            buckets: RwLock::new(HashMap::new()),
            max_requests,
            window,
        }
    }

    /// Convenience constructor for a per-minute window.
    pub fn per_minute(max_requests: u32) -> Self {
        Self::new(max_requests, Duration::from_secs(60))
    }

    fn refill_rate(&self) -> f64 {
        self.max_requests as f64 / self.window.as_secs_f64().max(1.0)
    }

    /// Tries to consume a token for this client.
    ///
    /// Returns true if allowed, false if rate limited.
    pub fn consume(&self, client_key: &str) -> bool {
        let mut buckets = self.buckets.write().unwrap();
        let rate = self.refill_rate();
        let bucket = buckets
            .entry(client_key.to_string())
            .or_insert_with(|| TokenBucket::new(self.max_requests, rate));
        bucket.try_consume()
    }

    /// Removes inactive client buckets (for memory cleanup).
    ///
    /// Removes buckets that haven't been accessed for the given duration.
    /// Returns the number of buckets removed.
    pub fn cleanup_inactive(&self, max_idle: Duration) -> usize {
        let mut buckets = self.buckets.write().unwrap();
        let now = Instant::now();
        let initial_count = buckets.len();

        buckets.retain(|_, bucket| now.duration_since(bucket.last_update) < max_idle);

        initial_count - buckets.len()
    }

    /// Returns the number of client buckets currently tracked.
    pub fn client_count(&self) -> usize {
        let buckets = self.buckets.read().unwrap();
        buckets.len()
    }
}
