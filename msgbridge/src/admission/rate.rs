//! Fixed-window request counting per API key.
//!
//! Windows are keyed by the hex SHA-256 of the raw key so the table never holds secrets.
//! Every call to [`RateLimiter::check_rate`] counts as a hit, including calls whose result
//! is only used to report headers on a request that will be rejected.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;

use super::clock::{Clock, expiry_after};

#[derive(Debug, Clone, Copy)]
struct RateWindow {
    count: u32,
    reset_at: DateTime<Utc>,
}

/// Outcome of one metered hit against a key's window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateStatus {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
}

impl RateStatus {
    /// Window reset as epoch seconds, rounded up so clients never retry early.
    pub fn reset_epoch_secs(&self) -> i64 {
        let secs = self.reset_at.timestamp();
        if self.reset_at.timestamp_subsec_nanos() > 0 { secs + 1 } else { secs }
    }
}

/// Fixed-window rate limiter shared by all requests in the process.
pub struct RateLimiter {
    clock: Arc<dyn Clock>,
    limit: u32,
    window: Duration,
    windows: DashMap<String, RateWindow>,
}

impl RateLimiter {
    pub fn new(clock: Arc<dyn Clock>, limit: u32, window: Duration) -> Self {
        Self {
            clock,
            limit,
            window,
            windows: DashMap::new(),
        }
    }

    /// Count one hit for `raw_key` and report whether it fits in the current window.
    pub fn check_rate(&self, raw_key: &str) -> RateStatus {
        let now = self.clock.now();
        let fresh = || RateWindow {
            count: 0,
            reset_at: expiry_after(now, self.window),
        };

        // The entry guard holds the shard lock, so reset-check-increment is atomic per key.
        let mut window = self.windows.entry(hash_key(raw_key)).or_insert_with(fresh);
        if now > window.reset_at {
            *window = fresh();
        }
        window.count = window.count.saturating_add(1);

        RateStatus {
            allowed: window.count <= self.limit,
            limit: self.limit,
            remaining: self.limit.saturating_sub(window.count),
            reset_at: window.reset_at,
        }
    }

    /// Drop windows whose reset time has passed, returning how many were removed.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let before = self.windows.len();
        self.windows.retain(|_, window| now <= window.reset_at);
        before.saturating_sub(self.windows.len())
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}

/// One-way digest used as the rate table key.
pub fn hash_key(raw_key: &str) -> String {
    hex::encode(Sha256::digest(raw_key.as_bytes()))
}
