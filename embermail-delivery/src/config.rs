//! Delivery-side configuration: retry backoff, worker pool sizing, and the
//! ambient knobs the spooler loop reads at startup.
//!
//! Mirrors the receive-path convention of a serde-derived tree with
//! `#[serde(default = ...)]` on every field, so a caller can deserialize a
//! partial document and still get sane defaults.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{dsn::DsnConfig, rate_limiter::RateLimitConfig};

/// Bounded exponential backoff for transient recipient failures.
///
/// `delay = min(base_delay_secs * 2^attempts, max_delay_secs)`. No jitter:
/// the spooler already staggers work across `worker_concurrency` workers
/// and a debounced trigger cooldown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Base delay for the first retry, in seconds.
    #[serde(default = "defaults::base_delay_secs")]
    pub base_delay_secs: u64,

    /// Ceiling on the computed delay, in seconds.
    #[serde(default = "defaults::max_delay_secs")]
    pub max_delay_secs: u64,

    /// Attempts after which a still-transient recipient is treated as a
    /// permanent failure and folded into a DSN.
    #[serde(default = "defaults::max_retries")]
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_secs: defaults::base_delay_secs(),
            max_delay_secs: defaults::max_delay_secs(),
            max_retries: defaults::max_retries(),
        }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt, given the number of attempts already made.
    #[must_use]
    pub fn backoff(&self, attempts: u32) -> Duration {
        let shift = attempts.min(63);
        let multiplier = 1u64 << shift;
        let secs = self
            .base_delay_secs
            .saturating_mul(multiplier)
            .min(self.max_delay_secs);
        Duration::from_secs(secs)
    }

    /// Whether an entry that has made `attempts` attempts should still be
    /// retried, or should instead be folded into a permanent-failure DSN.
    #[must_use]
    pub const fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_retries
    }
}

mod defaults {
    pub const fn base_delay_secs() -> u64 {
        60
    }

    pub const fn max_delay_secs() -> u64 {
        3600
    }

    pub const fn max_retries() -> u32 {
        8
    }

    pub fn worker_concurrency() -> usize {
        num_cpus::get()
    }

    pub const fn batch_size() -> usize {
        16
    }

    pub const fn poll_interval_secs() -> u64 {
        30
    }

    pub const fn trigger_cooldown_ms() -> u64 {
        500
    }

    pub const fn shutdown_timeout_secs() -> u64 {
        30
    }
}

/// Top-level configuration for the delivery service and its spooler workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    #[serde(flatten)]
    pub retry: RetryPolicy,

    /// Number of concurrent spooler workers.
    #[serde(default = "defaults::worker_concurrency")]
    pub worker_concurrency: usize,

    /// Maximum number of due entries a worker claims per `claim_due` round.
    #[serde(default = "defaults::batch_size")]
    pub batch_size: usize,

    /// How often a worker polls when it has received no explicit wake-up.
    #[serde(default = "defaults::poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Minimum gap enforced between explicit wake-ups (new enqueue, ETRN),
    /// so a burst of submissions triggers one claim round, not one per message.
    #[serde(default = "defaults::trigger_cooldown_ms")]
    pub trigger_cooldown_ms: u64,

    /// Upper bound on how long workers are given to drain their current
    /// entry during a graceful shutdown before the pool exits anyway.
    #[serde(default = "defaults::shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    #[serde(default)]
    pub dsn: DsnConfig,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            worker_concurrency: defaults::worker_concurrency(),
            batch_size: defaults::batch_size(),
            poll_interval_secs: defaults::poll_interval_secs(),
            trigger_cooldown_ms: defaults::trigger_cooldown_ms(),
            shutdown_timeout_secs: defaults::shutdown_timeout_secs(),
            rate_limit: RateLimitConfig::default(),
            dsn: DsnConfig::default(),
        }
    }
}

impl DeliveryConfig {
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    #[must_use]
    pub fn trigger_cooldown(&self) -> Duration {
        Duration::from_millis(self.trigger_cooldown_ms)
    }

    #[must_use]
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_then_caps() {
        let policy = RetryPolicy {
            base_delay_secs: 60,
            max_delay_secs: 3600,
            max_retries: 8,
        };
        assert_eq!(policy.backoff(0), Duration::from_secs(60));
        assert_eq!(policy.backoff(1), Duration::from_secs(120));
        assert_eq!(policy.backoff(2), Duration::from_secs(240));
        assert_eq!(policy.backoff(20), Duration::from_secs(3600));
    }

    #[test]
    fn should_retry_respects_max_retries() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(0));
        assert!(policy.should_retry(7));
        assert!(!policy.should_retry(8));
    }

    #[test]
    fn default_config_is_deserializable_from_empty_document() {
        let config: DeliveryConfig = ron::from_str("()").unwrap();
        assert_eq!(config.worker_concurrency, defaults::worker_concurrency());
    }
}
