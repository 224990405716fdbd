//! Runtime configuration for the quota subsystem.
//!
//! Loading and parsing of configuration files belongs to the embedding
//! application; this module only defines the settings the engine consumes
//! and their defaults.

use std::time::Duration;

use crate::cleaner::ExpirationPolicy;
use crate::quota::{Quota, StorageUnit};

/// Default period between eviction cycles.
const DEFAULT_CLEANUP_PERIOD: Duration = Duration::from_secs(10);

/// Default bound on eviction passes running at once.
const DEFAULT_MAX_CONCURRENT_CLEANUPS: usize = 2;

/// Default capacity of the tile-event queue.
const DEFAULT_QUEUE_SIZE: usize = 1000;

/// Default global quota when none is configured: 500 MiB.
const DEFAULT_GLOBAL_QUOTA_MIB: f64 = 500.0;

/// Explicit quota for one layer.
#[derive(Debug, Clone)]
pub struct LayerQuota {
    layer_name: String,
    quota: Quota,
    policy: ExpirationPolicy,
}

impl LayerQuota {
    pub fn new(layer_name: impl Into<String>, quota: Quota, policy: ExpirationPolicy) -> Self {
        Self {
            layer_name: layer_name.into(),
            quota,
            policy,
        }
    }

    pub fn layer_name(&self) -> &str {
        &self.layer_name
    }

    pub fn quota(&self) -> Quota {
        self.quota
    }

    pub fn policy(&self) -> ExpirationPolicy {
        self.policy
    }
}

/// Engine-wide settings plus the per-layer quota overrides. Layers without
/// an explicit entry are governed collectively by the global quota.
#[derive(Debug, Clone)]
pub struct QuotaConfig {
    cleanup_period: Duration,
    max_concurrent_cleanups: usize,
    queue_size: usize,
    global_quota: Quota,
    global_policy: ExpirationPolicy,
    layer_quotas: Vec<LayerQuota>,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            cleanup_period: DEFAULT_CLEANUP_PERIOD,
            max_concurrent_cleanups: DEFAULT_MAX_CONCURRENT_CLEANUPS,
            queue_size: DEFAULT_QUEUE_SIZE,
            global_quota: Quota::from_value(DEFAULT_GLOBAL_QUOTA_MIB, StorageUnit::MiB),
            global_policy: ExpirationPolicy::LeastFrequentlyUsed,
            layer_quotas: Vec::new(),
        }
    }
}

impl QuotaConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cleanup_period(mut self, period: Duration) -> Self {
        self.cleanup_period = period;
        self
    }

    pub fn with_max_concurrent_cleanups(mut self, max: usize) -> Self {
        self.max_concurrent_cleanups = max.max(1);
        self
    }

    pub fn with_queue_size(mut self, size: usize) -> Self {
        self.queue_size = size.max(1);
        self
    }

    pub fn with_global_quota(mut self, quota: Quota) -> Self {
        self.global_quota = quota;
        self
    }

    pub fn with_global_policy(mut self, policy: ExpirationPolicy) -> Self {
        self.global_policy = policy;
        self
    }

    pub fn with_layer_quota(mut self, layer_quota: LayerQuota) -> Self {
        self.layer_quotas
            .retain(|lq| lq.layer_name() != layer_quota.layer_name());
        self.layer_quotas.push(layer_quota);
        self
    }

    pub fn cleanup_period(&self) -> Duration {
        self.cleanup_period
    }

    pub fn max_concurrent_cleanups(&self) -> usize {
        self.max_concurrent_cleanups
    }

    pub fn queue_size(&self) -> usize {
        self.queue_size
    }

    pub fn global_quota(&self) -> Quota {
        self.global_quota
    }

    pub fn global_policy(&self) -> ExpirationPolicy {
        self.global_policy
    }

    /// Explicit quota for a layer, if configured.
    pub fn layer_quota(&self, layer_name: &str) -> Option<&LayerQuota> {
        self.layer_quotas
            .iter()
            .find(|lq| lq.layer_name() == layer_name)
    }

    /// Names of all layers with an explicit quota.
    pub fn layer_names(&self) -> Vec<String> {
        self.layer_quotas
            .iter()
            .map(|lq| lq.layer_name().to_string())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = QuotaConfig::default();
        assert_eq!(config.cleanup_period(), Duration::from_secs(10));
        assert_eq!(config.max_concurrent_cleanups(), 2);
        assert_eq!(config.queue_size(), 1000);
        assert_eq!(config.global_quota().bytes(), 500 * 1024 * 1024);
        assert_eq!(
            config.global_policy(),
            ExpirationPolicy::LeastFrequentlyUsed
        );
        assert!(config.layer_names().is_empty());
    }

    #[test]
    fn layer_quota_lookup() {
        let config = QuotaConfig::default().with_layer_quota(LayerQuota::new(
            "roads",
            Quota::from_value(1.0, StorageUnit::GiB),
            ExpirationPolicy::LeastRecentlyUsed,
        ));

        let lq = config.layer_quota("roads").expect("configured layer");
        assert_eq!(lq.quota().bytes(), 1 << 30);
        assert_eq!(lq.policy(), ExpirationPolicy::LeastRecentlyUsed);
        assert!(config.layer_quota("rivers").is_none());
    }

    #[test]
    fn repeated_layer_quota_replaces() {
        let config = QuotaConfig::default()
            .with_layer_quota(LayerQuota::new(
                "roads",
                Quota::from_value(1.0, StorageUnit::GiB),
                ExpirationPolicy::LeastRecentlyUsed,
            ))
            .with_layer_quota(LayerQuota::new(
                "roads",
                Quota::from_value(2.0, StorageUnit::GiB),
                ExpirationPolicy::LeastFrequentlyUsed,
            ));

        assert_eq!(config.layer_names(), vec!["roads".to_string()]);
        assert_eq!(config.layer_quota("roads").unwrap().quota().bytes(), 2 << 30);
    }

    #[test]
    fn sizes_are_floored_at_one() {
        let config = QuotaConfig::default()
            .with_max_concurrent_cleanups(0)
            .with_queue_size(0);
        assert_eq!(config.max_concurrent_cleanups(), 1);
        assert_eq!(config.queue_size(), 1);
    }
}
