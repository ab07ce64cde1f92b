//! Fixed-window rate limiting per caller key
//!
//! Each key has its own bucket behind its own mutex; the map is sharded, so
//! callers with different keys do not contend. A rejected call leaves the
//! count unchanged.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::debug;

use crate::error::{ControlError, ControlResult};

/// Rate limit settings applied to every key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Calls allowed per window
    pub limit: u32,
    /// Window length
    pub window_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            limit: 100,
            window_ms: 60_000,
        }
    }
}

impl RateLimitConfig {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window_ms: window.as_millis() as u64,
        }
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

/// A rejected call
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("rate limit of {limit} per {window:?} exceeded for '{key}', retry in {retry_after:?}")]
pub struct RateLimitError {
    pub key: String,
    pub limit: u32,
    pub window: Duration,
    /// Time until the current window ends
    pub retry_after: Duration,
}

impl From<RateLimitError> for ControlError {
    fn from(err: RateLimitError) -> Self {
        ControlError::RateLimited {
            key: err.key,
            retry_after: err.retry_after,
        }
    }
}

/// Rate limit check result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitResult {
    /// Request is allowed
    Allowed {
        /// Remaining calls in the current window
        remaining: u32,
        /// Time until the window resets
        resets_in: Duration,
    },
    /// Rate limit exceeded
    Exceeded(RateLimitError),
}

impl RateLimitResult {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitResult::Allowed { .. })
    }

    pub fn remaining(&self) -> Option<u32> {
        match self {
            RateLimitResult::Allowed { remaining, .. } => Some(*remaining),
            RateLimitResult::Exceeded(_) => None,
        }
    }
}

/// Non-incrementing view of a key's bucket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitStatus {
    pub key: String,
    pub limit: u32,
    pub used: u32,
    pub remaining: u32,
    pub resets_in: Duration,
}

#[derive(Debug)]
struct RateBucket {
    window_start: Instant,
    count: u32,
    last_seen: Instant,
}

impl RateBucket {
    fn new(now: Instant) -> Self {
        Self {
            window_start: now,
            count: 0,
            last_seen: now,
        }
    }

    fn roll(&mut self, now: Instant, window: Duration) {
        if now.duration_since(self.window_start) >= window {
            self.window_start = now;
            self.count = 0;
        }
    }

    fn resets_in(&self, now: Instant, window: Duration) -> Duration {
        window.saturating_sub(now.duration_since(self.window_start))
    }
}

/// Per-key fixed-window rate limiter
pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: DashMap<String, Arc<Mutex<RateBucket>>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: DashMap::new(),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Count a call for `key` if the window has room
    pub fn check(&self, key: &str) -> RateLimitResult {
        let now = Instant::now();
        let window = self.config.window();
        let bucket = self.bucket(key, now);

        let mut bucket = bucket.lock();
        bucket.roll(now, window);

        if bucket.count >= self.config.limit {
            let retry_after = bucket.resets_in(now, window);
            debug!(key = %key, count = bucket.count, "rate limit exceeded");
            return RateLimitResult::Exceeded(RateLimitError {
                key: key.to_string(),
                limit: self.config.limit,
                window,
                retry_after,
            });
        }

        bucket.count += 1;
        RateLimitResult::Allowed {
            remaining: self.config.limit - bucket.count,
            resets_in: bucket.resets_in(now, window),
        }
    }

    /// Boolean view of [`check`](Self::check)
    pub fn allow(&self, key: &str) -> bool {
        self.check(key).is_allowed()
    }

    /// [`check`](Self::check) mapped onto the control plane error type
    pub fn try_acquire(&self, key: &str) -> ControlResult<u32> {
        match self.check(key) {
            RateLimitResult::Allowed { remaining, .. } => Ok(remaining),
            RateLimitResult::Exceeded(err) => Err(err.into()),
        }
    }

    /// Current usage for `key` without counting a call
    pub fn status(&self, key: &str) -> Option<RateLimitStatus> {
        let bucket = Arc::clone(self.buckets.get(key)?.value());
        let now = Instant::now();
        let window = self.config.window();
        let bucket = bucket.lock();

        let expired = now.duration_since(bucket.window_start) >= window;
        let used = if expired { 0 } else { bucket.count };
        Some(RateLimitStatus {
            key: key.to_string(),
            limit: self.config.limit,
            used,
            remaining: self.config.limit.saturating_sub(used),
            resets_in: if expired {
                window
            } else {
                bucket.resets_in(now, window)
            },
        })
    }

    /// Forget `key`'s bucket; `true` if it existed
    pub fn reset(&self, key: &str) -> bool {
        self.buckets.remove(key).is_some()
    }

    /// Drop buckets that have been idle for more than two windows
    pub fn cleanup(&self) -> usize {
        let now = Instant::now();
        let idle_limit = self.config.window() * 2;
        let before = self.buckets.len();
        self.buckets
            .retain(|_, bucket| now.duration_since(bucket.lock().last_seen) <= idle_limit);
        before - self.buckets.len()
    }

    /// Number of tracked keys
    pub fn tracked_keys(&self) -> usize {
        self.buckets.len()
    }

    /// Bucket for `key`, marked as seen at `now`
    ///
    /// The mark is set while the map entry is still held, so `cleanup` can
    /// never drop a bucket that a caller is about to count against.
    fn bucket(&self, key: &str, now: Instant) -> Arc<Mutex<RateBucket>> {
        if let Some(bucket) = self.buckets.get(key) {
            bucket.lock().last_seen = now;
            return Arc::clone(bucket.value());
        }
        let bucket = self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(RateBucket::new(now))));
        bucket.lock().last_seen = now;
        Arc::clone(bucket.value())
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}
