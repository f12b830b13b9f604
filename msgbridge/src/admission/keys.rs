//! API key validation with a time-limited memo of results.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::clock::{Clock, expiry_after};
use crate::config::AdmissionConfig;

/// Prefix carried by keys issued in the provider format.
pub const KEY_PREFIX: &str = "sk-ant-";

/// Prefixed keys must be strictly longer than this many bytes.
const MIN_PREFIXED_KEY_LEN: usize = 40;

/// Decides whether a raw key is acceptable. Results are cached by [`KeyCache`].
pub trait KeyPolicy: Send + Sync {
    fn is_valid(&self, raw_key: &str) -> bool;
}

/// Accepts a key when any of these hold:
/// - it has the provider prefix and is longer than 40 bytes
/// - it is on the configured allow-list
/// - it equals the development key
#[derive(Debug, Clone, Default)]
pub struct ConfiguredKeyPolicy {
    allowed_keys: HashSet<String>,
    dev_key: Option<String>,
}

impl ConfiguredKeyPolicy {
    pub fn new(allowed_keys: impl IntoIterator<Item = String>, dev_key: Option<String>) -> Self {
        Self {
            allowed_keys: allowed_keys.into_iter().collect(),
            dev_key,
        }
    }

    pub fn from_config(config: &AdmissionConfig) -> Self {
        Self::new(config.allowed_keys.iter().cloned(), config.dev_key.clone())
    }
}

impl KeyPolicy for ConfiguredKeyPolicy {
    fn is_valid(&self, raw_key: &str) -> bool {
        (raw_key.starts_with(KEY_PREFIX) && raw_key.len() > MIN_PREFIXED_KEY_LEN)
            || self.allowed_keys.contains(raw_key)
            || self.dev_key.as_deref() == Some(raw_key)
    }
}

#[derive(Debug, Clone, Copy)]
struct AdmissionEntry {
    valid: bool,
    expires_at: DateTime<Utc>,
}

/// Memoizes [`KeyPolicy`] decisions per raw key for a fixed time-to-live.
///
/// A hit within the TTL returns the remembered answer without consulting the policy.
/// Expired entries are replaced on the next lookup and removed in bulk by [`KeyCache::sweep`].
pub struct KeyCache {
    policy: Arc<dyn KeyPolicy>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    entries: DashMap<String, AdmissionEntry>,
}

impl KeyCache {
    pub fn new(policy: Arc<dyn KeyPolicy>, clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self {
            policy,
            clock,
            ttl,
            entries: DashMap::new(),
        }
    }

    /// Returns whether `raw_key` is valid. Malformed keys are simply invalid.
    pub fn validate(&self, raw_key: &str) -> bool {
        let now = self.clock.now();

        let cached = self.entries.get(raw_key).map(|entry| *entry);
        if let Some(entry) = cached
            && now <= entry.expires_at
        {
            return entry.valid;
        }

        let valid = self.policy.is_valid(raw_key);
        debug!(valid, "Evaluated API key against admission policy");
        self.entries.insert(
            raw_key.to_string(),
            AdmissionEntry {
                valid,
                expires_at: expiry_after(now, self.ttl),
            },
        );
        valid
    }

    /// Removes entries whose expiry has passed, returning how many were evicted.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| now <= entry.expires_at);
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
