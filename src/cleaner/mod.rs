//! Quota enforcement: the periodic eviction task and its policies.
//!
//! [`CacheCleanerTask`] wakes on a fixed period, compares each governed
//! layer's usage against its limit and, when a limit is exceeded, runs an
//! enforcement pass: ask the store for the best eviction candidate under the
//! configured policy, truncate that page's tile range in the external tile
//! store, mark the page truncated and re-check. Layers without an explicit
//! quota are governed collectively by the global quota.
//!
//! The byte decrease from a truncation arrives later through the normal
//! event pipeline, so each pass re-reads usage every iteration rather than
//! assuming its own effect.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::QuotaConfig;
use crate::pyramid::TileRange;
use crate::quota::Quota;
use crate::store::{QuotaStore, StoreError};
use crate::tileset::{TileSet, GLOBAL_QUOTA_ID};

/// Strategy for picking which page to evict when a quota is exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpirationPolicy {
    LeastRecentlyUsed,
    LeastFrequentlyUsed,
}

/// Unrecognized expiration policy name.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown expiration policy {0:?}, expected \"LRU\" or \"LFU\"")]
pub struct ParsePolicyError(String);

impl FromStr for ExpirationPolicy {
    type Err = ParsePolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "LRU" => Ok(Self::LeastRecentlyUsed),
            "LFU" => Ok(Self::LeastFrequentlyUsed),
            other => Err(ParsePolicyError(other.to_string())),
        }
    }
}

impl fmt::Display for ExpirationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LeastRecentlyUsed => f.write_str("LRU"),
            Self::LeastFrequentlyUsed => f.write_str("LFU"),
        }
    }
}

/// External tile store, as far as eviction is concerned: it can remove all
/// tiles inside a rectangle.
pub trait TileStoreTruncator: Send + Sync {
    /// Remove every tile of `tile_set` inside `range`. The resulting byte
    /// decrease is reported back through the regular event pipeline, not by
    /// this call.
    fn truncate(
        &self,
        tile_set: &TileSet,
        range: &TileRange,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// Hook for the embedding application to report a layer whose cache
/// statistics are being rebuilt; such layers are skipped for a cycle since
/// their usage numbers are in flux.
pub trait LayerRebuildProbe: Send + Sync {
    fn is_rebuilding(&self, layer_name: &str) -> bool;
}

/// Probe for deployments without background rebuilds.
pub struct NoRebuilds;

impl LayerRebuildProbe for NoRebuilds {
    fn is_rebuilding(&self, _layer_name: &str) -> bool {
        false
    }
}

/// What an enforcement pass is working against: one layer's own quota, or
/// the global quota shared by all layers without one.
#[derive(Debug, Clone)]
pub enum QuotaResolver {
    Global {
        limit: Quota,
        layer_names: Vec<String>,
    },
    Layer {
        layer_name: String,
        limit: Quota,
    },
}

impl QuotaResolver {
    pub fn limit(&self) -> Quota {
        match self {
            Self::Global { limit, .. } => *limit,
            Self::Layer { limit, .. } => *limit,
        }
    }

    pub fn layer_names(&self) -> Vec<String> {
        match self {
            Self::Global { layer_names, .. } => layer_names.clone(),
            Self::Layer { layer_name, .. } => vec![layer_name.clone()],
        }
    }

    pub async fn used(&self, store: &QuotaStore) -> Result<Quota, StoreError> {
        match self {
            Self::Global { .. } => store.get_globally_used_quota().await,
            Self::Layer { layer_name, .. } => {
                store.get_used_quota_by_layer_name(layer_name).await
            }
        }
    }
}

/// One enforcement pass at a time: pick, truncate, mark, repeat.
pub struct CacheCleaner {
    store: QuotaStore,
    truncator: Arc<dyn TileStoreTruncator>,
}

impl CacheCleaner {
    pub fn new(store: QuotaStore, truncator: Arc<dyn TileStoreTruncator>) -> Self {
        Self { store, truncator }
    }

    /// Evict pages from the given layers until usage falls to the limit or
    /// no candidate remains. Re-reads usage each iteration and honors
    /// cancellation between pages.
    pub async fn expire_by_layer_names(
        &self,
        resolver: &QuotaResolver,
        policy: ExpirationPolicy,
        cancel: &CancellationToken,
    ) -> Result<(), StoreError> {
        let layer_names = resolver.layer_names();
        let limit = resolver.limit();

        loop {
            if cancel.is_cancelled() {
                debug!("enforcement pass cancelled");
                return Ok(());
            }

            let used = resolver.used(&self.store).await?;
            if used <= limit {
                return Ok(());
            }
            let excess = used.difference(&limit);

            let candidate = match policy {
                ExpirationPolicy::LeastRecentlyUsed => {
                    self.store.get_least_recently_used_page(&layer_names).await?
                }
                ExpirationPolicy::LeastFrequentlyUsed => {
                    self.store
                        .get_least_frequently_used_page(&layer_names)
                        .await?
                }
            };
            let page = match candidate {
                Some(page) => page,
                None => {
                    warn!(
                        %policy,
                        excess = %excess.to_nice_string(),
                        "quota exceeded but no page is eligible for eviction"
                    );
                    return Ok(());
                }
            };

            let tile_set = self.store.get_tile_set_by_id(page.tile_set_id()).await?;
            let range = self.store.get_tiles_for_page(&page).await?;
            debug!(
                page = %page,
                excess = %excess.to_nice_string(),
                "truncating page"
            );
            if let Err(err) = self.truncator.truncate(&tile_set, &range) {
                warn!(page = %page, error = %err, "tile store truncation failed");
                return Ok(());
            }
            self.store.set_truncated(&page).await?;
        }
    }
}

/// Periodic driver for enforcement passes.
///
/// Each cycle walks the configured layers; a layer is skipped while its
/// statistics are being rebuilt or while its previous pass still runs.
/// Concurrent passes are bounded by a semaphore sized from the
/// configuration.
pub struct CacheCleanerTask {
    store: QuotaStore,
    cleaner: Arc<CacheCleaner>,
    config: QuotaConfig,
    rebuild_probe: Arc<dyn LayerRebuildProbe>,
    cancel: CancellationToken,
    cleanup_permits: Arc<Semaphore>,
    running: Arc<Mutex<HashMap<String, tokio::task::JoinHandle<()>>>>,
}

impl CacheCleanerTask {
    pub fn new(
        store: QuotaStore,
        cleaner: Arc<CacheCleaner>,
        config: QuotaConfig,
        rebuild_probe: Arc<dyn LayerRebuildProbe>,
        cancel: CancellationToken,
    ) -> Self {
        let cleanup_permits = Arc::new(Semaphore::new(config.max_concurrent_cleanups()));
        Self {
            store,
            cleaner,
            config,
            rebuild_probe,
            cancel,
            cleanup_permits,
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Run cycles on the configured period until cancelled. Meant to be
    /// spawned.
    pub async fn run(self) {
        info!(
            period_secs = self.config.cleanup_period().as_secs(),
            "cache cleaner task started"
        );
        let mut interval = tokio::time::interval(self.config.cleanup_period());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = interval.tick() => self.run_cycle().await,
            }
        }
        info!("cache cleaner task stopped");
    }

    async fn run_cycle(&self) {
        let mut globally_governed = Vec::new();
        for layer in self.store.layer_names() {
            match self.config.layer_quota(&layer) {
                Some(layer_quota) => {
                    let resolver = QuotaResolver::Layer {
                        layer_name: layer.clone(),
                        limit: layer_quota.quota(),
                    };
                    self.maybe_clean(layer, resolver, layer_quota.policy()).await;
                }
                None => globally_governed.push(layer),
            }
        }

        if !globally_governed.is_empty() {
            let resolver = QuotaResolver::Global {
                limit: self.config.global_quota(),
                layer_names: globally_governed,
            };
            self.maybe_clean(
                GLOBAL_QUOTA_ID.to_string(),
                resolver,
                self.config.global_policy(),
            )
            .await;
        }
    }

    /// Start an enforcement pass for one governed scope unless it should be
    /// skipped this cycle.
    async fn maybe_clean(&self, scope: String, resolver: QuotaResolver, policy: ExpirationPolicy) {
        for layer in resolver.layer_names() {
            if self.rebuild_probe.is_rebuilding(&layer) {
                debug!(layer = %layer, "skipping cycle, cache statistics rebuild in progress");
                return;
            }
        }

        {
            let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(handle) = running.get(&scope) {
                if !handle.is_finished() {
                    debug!(scope = %scope, "skipping cycle, previous pass still running");
                    return;
                }
                running.remove(&scope);
            }
        }

        let used = match resolver.used(&self.store).await {
            Ok(used) => used,
            Err(err) => {
                warn!(scope = %scope, error = %err, "cannot read usage, skipping cycle");
                return;
            }
        };
        if used <= resolver.limit() {
            return;
        }

        let permit = match Arc::clone(&self.cleanup_permits).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                debug!(scope = %scope, "skipping cycle, concurrent cleanup limit reached");
                return;
            }
        };

        info!(
            scope = %scope,
            used = %used.to_nice_string(),
            limit = %resolver.limit().to_nice_string(),
            %policy,
            "quota exceeded, starting enforcement pass"
        );
        let cleaner = Arc::clone(&self.cleaner);
        let cancel = self.cancel.clone();
        let scope_name = scope.clone();
        let handle = tokio::spawn(async move {
            let _permit = permit;
            if let Err(err) = cleaner
                .expire_by_layer_names(&resolver, policy, &cancel)
                .await
            {
                warn!(scope = %scope_name, error = %err, "enforcement pass failed");
            }
        });
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        running.insert(scope, handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::{PageStatsPayload, TilePage};
    use crate::pyramid::{LevelCoverage, TilePageCalculator, TileSetSource};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    struct StaticConfig {
        tile_sets: Vec<TileSet>,
    }

    impl TileSetSource for StaticConfig {
        fn layer_names(&self) -> Vec<String> {
            let mut names: Vec<String> = self
                .tile_sets
                .iter()
                .map(|ts| ts.layer_name().to_string())
                .collect();
            names.dedup();
            names
        }

        fn tile_sets_for(&self, layer_name: &str) -> Vec<TileSet> {
            self.tile_sets
                .iter()
                .filter(|ts| ts.layer_name() == layer_name)
                .cloned()
                .collect()
        }

        fn coverage_of(&self, tile_set: &TileSet) -> Option<(u8, u8, Vec<LevelCoverage>)> {
            self.tile_sets.contains(tile_set).then(|| {
                (
                    0,
                    0,
                    vec![LevelCoverage {
                        min_x: 0,
                        min_y: 0,
                        max_x: 255,
                        max_y: 255,
                        zoom: 0,
                    }],
                )
            })
        }
    }

    /// Truncator that acknowledges deletions and feeds the byte decrease
    /// back into the store, as the real event pipeline would.
    struct CountingTruncator {
        store: QuotaStore,
        bytes_per_page: i128,
        truncated: AtomicUsize,
    }

    impl TileStoreTruncator for CountingTruncator {
        fn truncate(
            &self,
            tile_set: &TileSet,
            _range: &TileRange,
        ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            self.truncated.fetch_add(1, Ordering::SeqCst);
            self.store
                .add_to_quota_and_tile_counts(
                    tile_set,
                    Quota::from_bytes(-self.bytes_per_page),
                    Vec::new(),
                )
                .map_err(|e| Box::new(e) as _)
        }
    }

    struct FailingTruncator;

    impl TileStoreTruncator for FailingTruncator {
        fn truncate(
            &self,
            _tile_set: &TileSet,
            _range: &TileRange,
        ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            Err("tile store offline".into())
        }
    }

    fn roads() -> TileSet {
        TileSet::new("roads", "EPSG:4326", "image/png", None)
    }

    fn open_store(dir: &TempDir) -> (QuotaStore, tokio::task::JoinHandle<()>) {
        let calculator = Arc::new(TilePageCalculator::new(Arc::new(StaticConfig {
            tile_sets: vec![roads()],
        })));
        QuotaStore::open(dir.path(), calculator).expect("store must open")
    }

    async fn fill_page(store: &QuotaStore, ts: &TileSet, page_x: u32, bytes: i128) -> TilePage {
        let page = TilePage::new(ts.key(), page_x, 0, 0);
        let mut payload = PageStatsPayload::new(page.clone());
        payload.set_num_tiles(25);
        store
            .add_to_quota_and_tile_counts(ts, Quota::from_bytes(bytes), vec![payload])
            .unwrap();
        // Round trip so the fire-and-forget delta is applied.
        store.create_layer(ts.layer_name()).await.unwrap();
        page
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Policy parsing
    // ─────────────────────────────────────────────────────────────────────────

    #[test]
    fn policy_parses_from_config_names() {
        assert_eq!(
            "LRU".parse::<ExpirationPolicy>().unwrap(),
            ExpirationPolicy::LeastRecentlyUsed
        );
        assert_eq!(
            "LFU".parse::<ExpirationPolicy>().unwrap(),
            ExpirationPolicy::LeastFrequentlyUsed
        );
        assert!("lru".parse::<ExpirationPolicy>().is_err());
        assert_eq!(ExpirationPolicy::LeastRecentlyUsed.to_string(), "LRU");
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Enforcement pass
    // ─────────────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn pass_evicts_until_under_limit() {
        let dir = TempDir::new().unwrap();
        let (store, writer) = open_store(&dir);
        let ts = roads();

        // Three filled pages of 1000 bytes each, limit 1500: two must go.
        for page_x in 0..3 {
            fill_page(&store, &ts, page_x, 1000).await;
        }

        let truncator = Arc::new(CountingTruncator {
            store: store.clone(),
            bytes_per_page: 1000,
            truncated: AtomicUsize::new(0),
        });
        let cleaner = CacheCleaner::new(store.clone(), Arc::clone(&truncator) as _);
        let resolver = QuotaResolver::Layer {
            layer_name: "roads".to_string(),
            limit: Quota::from_bytes(1500),
        };

        cleaner
            .expire_by_layer_names(
                &resolver,
                ExpirationPolicy::LeastRecentlyUsed,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(truncator.truncated.load(Ordering::SeqCst), 2);
        let used = store.get_used_quota_by_layer_name("roads").await.unwrap();
        assert!(used.bytes() <= 1500);

        store.close(writer).await;
    }

    #[tokio::test]
    async fn pass_stops_when_no_candidate_remains() {
        let dir = TempDir::new().unwrap();
        let (store, writer) = open_store(&dir);
        let ts = roads();

        // Usage over limit but no page has a nonzero fill factor.
        store
            .add_to_quota_and_tile_counts(&ts, Quota::from_bytes(5000), Vec::new())
            .unwrap();
        store.create_layer("roads").await.unwrap();

        let truncator = Arc::new(CountingTruncator {
            store: store.clone(),
            bytes_per_page: 1000,
            truncated: AtomicUsize::new(0),
        });
        let cleaner = CacheCleaner::new(store.clone(), Arc::clone(&truncator) as _);
        let resolver = QuotaResolver::Layer {
            layer_name: "roads".to_string(),
            limit: Quota::from_bytes(1000),
        };

        // Must terminate, not spin.
        cleaner
            .expire_by_layer_names(
                &resolver,
                ExpirationPolicy::LeastFrequentlyUsed,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(truncator.truncated.load(Ordering::SeqCst), 0);

        store.close(writer).await;
    }

    #[tokio::test]
    async fn pass_gives_up_after_truncation_failure() {
        let dir = TempDir::new().unwrap();
        let (store, writer) = open_store(&dir);
        let ts = roads();
        fill_page(&store, &ts, 0, 5000).await;

        let cleaner = CacheCleaner::new(store.clone(), Arc::new(FailingTruncator));
        let resolver = QuotaResolver::Layer {
            layer_name: "roads".to_string(),
            limit: Quota::from_bytes(1000),
        };

        cleaner
            .expire_by_layer_names(
                &resolver,
                ExpirationPolicy::LeastRecentlyUsed,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        // The page was not marked truncated, so it remains a candidate.
        let layers = vec!["roads".to_string()];
        assert!(store
            .get_least_recently_used_page(&layers)
            .await
            .unwrap()
            .is_some());

        store.close(writer).await;
    }

    #[tokio::test]
    async fn cancelled_pass_returns_promptly() {
        let dir = TempDir::new().unwrap();
        let (store, writer) = open_store(&dir);
        let ts = roads();
        fill_page(&store, &ts, 0, 5000).await;

        let truncator = Arc::new(CountingTruncator {
            store: store.clone(),
            bytes_per_page: 0, // never reduces usage
            truncated: AtomicUsize::new(0),
        });
        let cleaner = CacheCleaner::new(store.clone(), Arc::clone(&truncator) as _);
        let resolver = QuotaResolver::Layer {
            layer_name: "roads".to_string(),
            limit: Quota::from_bytes(1000),
        };

        let cancel = CancellationToken::new();
        cancel.cancel();
        cleaner
            .expire_by_layer_names(&resolver, ExpirationPolicy::LeastRecentlyUsed, &cancel)
            .await
            .unwrap();
        assert_eq!(truncator.truncated.load(Ordering::SeqCst), 0);

        store.close(writer).await;
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Periodic task
    // ─────────────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn task_enforces_global_quota_for_unconfigured_layers() {
        let dir = TempDir::new().unwrap();
        let (store, writer) = open_store(&dir);
        let ts = roads();
        for page_x in 0..3 {
            fill_page(&store, &ts, page_x, 1000).await;
        }

        let truncator = Arc::new(CountingTruncator {
            store: store.clone(),
            bytes_per_page: 1000,
            truncated: AtomicUsize::new(0),
        });
        let cleaner = Arc::new(CacheCleaner::new(
            store.clone(),
            Arc::clone(&truncator) as _,
        ));
        let config = QuotaConfig::default()
            .with_cleanup_period(Duration::from_millis(20))
            .with_global_quota(Quota::from_bytes(1500));
        let cancel = CancellationToken::new();
        let task = CacheCleanerTask::new(
            store.clone(),
            cleaner,
            config,
            Arc::new(NoRebuilds),
            cancel.clone(),
        );
        let handle = tokio::spawn(task.run());

        // Give the task a few cycles to bring usage down.
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let used = store.get_globally_used_quota().await.unwrap();
            if used.bytes() <= 1500 {
                break;
            }
        }
        let used = store.get_globally_used_quota().await.unwrap();
        assert!(used.bytes() <= 1500, "usage still {} bytes", used.bytes());

        cancel.cancel();
        handle.await.unwrap();
        store.close(writer).await;
    }

    #[tokio::test]
    async fn rebuilding_layers_are_skipped() {
        struct AlwaysRebuilding;
        impl LayerRebuildProbe for AlwaysRebuilding {
            fn is_rebuilding(&self, _layer_name: &str) -> bool {
                true
            }
        }

        let dir = TempDir::new().unwrap();
        let (store, writer) = open_store(&dir);
        let ts = roads();
        fill_page(&store, &ts, 0, 5000).await;

        let truncator = Arc::new(CountingTruncator {
            store: store.clone(),
            bytes_per_page: 1000,
            truncated: AtomicUsize::new(0),
        });
        let cleaner = Arc::new(CacheCleaner::new(
            store.clone(),
            Arc::clone(&truncator) as _,
        ));
        let config = QuotaConfig::default()
            .with_cleanup_period(Duration::from_millis(10))
            .with_global_quota(Quota::from_bytes(1000));
        let cancel = CancellationToken::new();
        let task = CacheCleanerTask::new(
            store.clone(),
            cleaner,
            config,
            Arc::new(AlwaysRebuilding),
            cancel.clone(),
        );
        let handle = tokio::spawn(task.run());

        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(truncator.truncated.load(Ordering::SeqCst), 0);
        store.close(writer).await;
    }
}
