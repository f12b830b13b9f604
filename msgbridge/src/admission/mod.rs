//! Request admission: API key validation and per-key rate limiting.
//!
//! [`Admission`] owns both tables. It is built once at startup and shared through
//! [`crate::AppState`]; a background sweeper evicts expired entries so memory stays
//! bounded by the number of keys seen within one TTL or window.

pub mod clock;
pub mod keys;
pub mod rate;

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::AdmissionConfig;
pub use clock::{Clock, SystemClock};
pub use keys::{ConfiguredKeyPolicy, KeyCache, KeyPolicy};
pub use rate::{RateLimiter, RateStatus};

/// Entries removed by one sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepStats {
    pub expired_keys: usize,
    pub expired_windows: usize,
}

pub struct Admission {
    keys: KeyCache,
    rates: RateLimiter,
}

impl Admission {
    /// Admission with the configured allow-list and dev key policy
    pub fn new(config: &AdmissionConfig, clock: Arc<dyn Clock>) -> Self {
        Self::with_policy(config, Arc::new(ConfiguredKeyPolicy::from_config(config)), clock)
    }

    pub fn with_policy(config: &AdmissionConfig, policy: Arc<dyn KeyPolicy>, clock: Arc<dyn Clock>) -> Self {
        Self {
            keys: KeyCache::new(policy, clock.clone(), config.key_ttl),
            rates: RateLimiter::new(clock, config.rate_limit, config.rate_window),
        }
    }

    pub fn validate(&self, raw_key: &str) -> bool {
        self.keys.validate(raw_key)
    }

    /// Meters one hit. Call at most once per inbound request.
    pub fn check_rate(&self, raw_key: &str) -> RateStatus {
        self.rates.check_rate(raw_key)
    }

    pub fn sweep(&self) -> SweepStats {
        SweepStats {
            expired_keys: self.keys.sweep(),
            expired_windows: self.rates.sweep(),
        }
    }

    /// Run [`Admission::sweep`] every `interval` until `shutdown` is cancelled.
    ///
    /// The first sweep happens one full interval after spawning.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        let admission = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // interval() fires immediately; skip that tick
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("Admission sweeper shutting down");
                        return;
                    }
                    _ = ticker.tick() => {}
                }

                let stats = admission.sweep();
                if stats != SweepStats::default() {
                    debug!(expired_keys = stats.expired_keys, expired_windows = stats.expired_windows, "Swept admission tables");
                } else {
                    tracing::trace!("Admission sweep found nothing to evict");
                }
            }
        })
    }

    #[cfg(test)]
    fn table_sizes(&self) -> (usize, usize) {
        (self.keys.len(), self.rates.len())
    }
}
