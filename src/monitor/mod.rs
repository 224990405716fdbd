//! Write-behind pipeline between the tile store and the accounting engine.
//!
//! Tile serving threads produce store/delete/hit events faster than one
//! transaction per tile could absorb. The [`QuotaEventProducer`] pushes
//! events onto a bounded queue and the [`QuotaUpdatesMonitor`] consumer
//! batches them per tile set before flushing to the [`QuotaStore`], so a
//! burst of tile activity costs a handful of transactions instead of
//! hundreds.
//!
//! A full queue never blocks tile serving silently: the producer either
//! blocks with a bounded timeout or drops the event and logs, per the
//! configured [`BackpressurePolicy`]. A dropped event loses a little
//! accounting precision, never correctness of served tiles.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::page::PageStatsPayload;
use crate::pyramid::TilePageCalculator;
use crate::quota::Quota;
use crate::store::QuotaStore;
use crate::tileset::TileSet;
use crate::time::current_time_millis;

/// How long aggregated updates may sit before a flush is attempted.
const DEFAULT_SYNC_TIMEOUT: Duration = Duration::from_millis(100);

/// Hard cap on aggregated events before a flush, regardless of age.
const MAX_AGGREGATES_BEFORE_COMMIT: usize = 1000;

/// A batch younger than this that touches few pages may keep aggregating
/// past the sync timeout.
const CAN_WAIT_MAX_AGE: Duration = Duration::from_secs(2);

/// Distinct-page ceiling for the "can wait a bit longer" damper.
const CAN_WAIT_MAX_PAGES: usize = 1000;

/// What a producer does when the event queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackpressurePolicy {
    /// Block the producer for at most the given duration, then drop and
    /// log.
    BlockWithTimeout(Duration),
    /// Drop the event immediately and log.
    DropAndLog,
}

impl Default for BackpressurePolicy {
    fn default() -> Self {
        Self::BlockWithTimeout(DEFAULT_SYNC_TIMEOUT)
    }
}

/// One observed tile-store event.
#[derive(Debug, Clone)]
pub enum TileEvent {
    /// A tile was written. `size_bytes` is its stored size.
    Stored {
        tile_set: TileSet,
        x: u64,
        y: u64,
        zoom: u8,
        size_bytes: u64,
    },
    /// A tile was removed. `size_bytes` is the size it occupied.
    Deleted {
        tile_set: TileSet,
        x: u64,
        y: u64,
        zoom: u8,
        size_bytes: u64,
    },
    /// A tile was served from the cache.
    Hit {
        tile_set: TileSet,
        x: u64,
        y: u64,
        zoom: u8,
    },
}

/// Producer handle for tile-store events. Cheap to clone, shared across
/// request handlers.
#[derive(Clone)]
pub struct QuotaEventProducer {
    tx: mpsc::Sender<TileEvent>,
    policy: BackpressurePolicy,
}

impl QuotaEventProducer {
    /// Record a stored tile. Zero-sized writes carry no quota information
    /// and are ignored.
    pub async fn tile_stored(&self, tile_set: &TileSet, x: u64, y: u64, zoom: u8, size_bytes: u64) {
        if size_bytes == 0 {
            return;
        }
        self.send(TileEvent::Stored {
            tile_set: tile_set.clone(),
            x,
            y,
            zoom,
            size_bytes,
        })
        .await;
    }

    /// Record a deleted tile.
    pub async fn tile_deleted(
        &self,
        tile_set: &TileSet,
        x: u64,
        y: u64,
        zoom: u8,
        size_bytes: u64,
    ) {
        if size_bytes == 0 {
            return;
        }
        self.send(TileEvent::Deleted {
            tile_set: tile_set.clone(),
            x,
            y,
            zoom,
            size_bytes,
        })
        .await;
    }

    /// Record a cache hit.
    pub async fn tile_hit(&self, tile_set: &TileSet, x: u64, y: u64, zoom: u8) {
        self.send(TileEvent::Hit {
            tile_set: tile_set.clone(),
            x,
            y,
            zoom,
        })
        .await;
    }

    async fn send(&self, event: TileEvent) {
        match self.policy {
            BackpressurePolicy::BlockWithTimeout(limit) => {
                if tokio::time::timeout(limit, self.tx.send(event)).await.is_err() {
                    warn!(
                        timeout_millis = limit.as_millis() as u64,
                        "quota event queue full, dropping event after timeout"
                    );
                }
            }
            BackpressurePolicy::DropAndLog => {
                if self.tx.try_send(event).is_err() {
                    warn!("quota event queue full, dropping event");
                }
            }
        }
    }
}

/// Per tile-set aggregation of pending accounting deltas.
struct TileSetAggregate {
    tile_set: TileSet,
    delta_bytes: i128,
    payloads: HashMap<String, PageStatsPayload>,
}

/// Pending batch state between flushes.
#[derive(Default)]
struct Batch {
    quota_updates: HashMap<String, TileSetAggregate>,
    hit_payloads: HashMap<String, PageStatsPayload>,
    aggregated_events: usize,
    oldest: Option<Instant>,
}

impl Batch {
    fn is_empty(&self) -> bool {
        self.aggregated_events == 0
    }

    fn distinct_pages(&self) -> usize {
        self.quota_updates
            .values()
            .map(|agg| agg.payloads.len())
            .sum::<usize>()
            + self.hit_payloads.len()
    }

    fn age(&self) -> Duration {
        self.oldest.map(|t| t.elapsed()).unwrap_or(Duration::ZERO)
    }

    /// Whether the batch should be flushed now. A batch that is both young
    /// and narrow (few distinct pages) keeps aggregating even past the sync
    /// timeout or the event cap, since waiting amortizes more events into
    /// the same transaction; once it is old or wide, either trigger commits
    /// it.
    fn should_flush(&self) -> bool {
        if self.is_empty() {
            return false;
        }
        let age = self.age();
        if age < CAN_WAIT_MAX_AGE && self.distinct_pages() < CAN_WAIT_MAX_PAGES {
            return false;
        }
        age >= DEFAULT_SYNC_TIMEOUT || self.aggregated_events >= MAX_AGGREGATES_BEFORE_COMMIT
    }
}

/// Single consumer of the tile-event queue.
///
/// Runs until cancelled; cancellation triggers one final flush so no
/// aggregated update is lost on shutdown.
pub struct QuotaUpdatesMonitor {
    store: QuotaStore,
    calculator: Arc<TilePageCalculator>,
    rx: mpsc::Receiver<TileEvent>,
    cancel: CancellationToken,
}

impl QuotaUpdatesMonitor {
    /// Create the queue, its producer handle and the consumer.
    ///
    /// # Arguments
    ///
    /// * `store` - Accounting engine the batches flush to.
    /// * `calculator` - Maps tile coordinates to pages.
    /// * `queue_size` - Bounded queue capacity.
    /// * `policy` - Producer behavior when the queue is full.
    /// * `cancel` - Shutdown signal.
    pub fn new(
        store: QuotaStore,
        calculator: Arc<TilePageCalculator>,
        queue_size: usize,
        policy: BackpressurePolicy,
        cancel: CancellationToken,
    ) -> (QuotaEventProducer, Self) {
        let (tx, rx) = mpsc::channel(queue_size);
        let producer = QuotaEventProducer { tx, policy };
        let monitor = Self {
            store,
            calculator,
            rx,
            cancel,
        };
        (producer, monitor)
    }

    /// Consume events until cancelled, flushing batches per the timing
    /// rules. Meant to be spawned.
    pub async fn run(mut self) {
        debug!("quota updates monitor started");
        let cancel = self.cancel.clone();
        let mut batch = Batch::default();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    // Drain whatever is already queued, then flush once.
                    while let Ok(event) = self.rx.try_recv() {
                        self.aggregate(&mut batch, event);
                    }
                    self.flush(&mut batch).await;
                    break;
                }
                received = tokio::time::timeout(DEFAULT_SYNC_TIMEOUT, self.rx.recv()) => {
                    match received {
                        Ok(Some(event)) => self.aggregate(&mut batch, event),
                        Ok(None) => {
                            self.flush(&mut batch).await;
                            break;
                        }
                        Err(_) => {} // queue idle, fall through to the flush check
                    }
                    if batch.should_flush() {
                        self.flush(&mut batch).await;
                    }
                }
            }
        }
        debug!("quota updates monitor stopped");
    }

    fn aggregate(&self, batch: &mut Batch, event: TileEvent) {
        if batch.oldest.is_none() {
            batch.oldest = Some(Instant::now());
        }
        match event {
            TileEvent::Stored {
                tile_set,
                x,
                y,
                zoom,
                size_bytes,
            } => self.aggregate_delta(batch, tile_set, x, y, zoom, size_bytes as i128, 1),
            TileEvent::Deleted {
                tile_set,
                x,
                y,
                zoom,
                size_bytes,
            } => self.aggregate_delta(batch, tile_set, x, y, zoom, -(size_bytes as i128), -1),
            TileEvent::Hit { tile_set, x, y, zoom } => {
                let page = match self.calculator.page_for_tile(&tile_set, x, y, zoom) {
                    Ok(page) => page,
                    Err(err) => {
                        warn!(
                            tile_set = %tile_set.key(),
                            x, y, zoom,
                            error = %err,
                            "discarding hit for unaddressable tile"
                        );
                        return;
                    }
                };
                batch.aggregated_events += 1;
                batch
                    .hit_payloads
                    .entry(page.key())
                    .or_insert_with(|| PageStatsPayload::new(page))
                    .add_hits(1, current_time_millis());
            }
        }
    }

    fn aggregate_delta(
        &self,
        batch: &mut Batch,
        tile_set: TileSet,
        x: u64,
        y: u64,
        zoom: u8,
        delta_bytes: i128,
        delta_tiles: i64,
    ) {
        let page = match self.calculator.page_for_tile(&tile_set, x, y, zoom) {
            Ok(page) => page,
            Err(err) => {
                warn!(
                    tile_set = %tile_set.key(),
                    x, y, zoom,
                    error = %err,
                    "discarding accounting event for unaddressable tile"
                );
                return;
            }
        };
        batch.aggregated_events += 1;
        let aggregate = batch
            .quota_updates
            .entry(tile_set.key().to_string())
            .or_insert_with(|| TileSetAggregate {
                tile_set,
                delta_bytes: 0,
                payloads: HashMap::new(),
            });
        aggregate.delta_bytes += delta_bytes;
        let payload = aggregate
            .payloads
            .entry(page.key())
            .or_insert_with(|| PageStatsPayload::new(page));
        payload.set_num_tiles(payload.num_tiles() + delta_tiles);
    }

    async fn flush(&self, batch: &mut Batch) {
        if batch.is_empty() {
            return;
        }
        trace!(
            events = batch.aggregated_events,
            pages = batch.distinct_pages(),
            age_millis = batch.age().as_millis() as u64,
            "flushing aggregated quota updates"
        );

        for (_, aggregate) in batch.quota_updates.drain() {
            let payloads: Vec<PageStatsPayload> = aggregate.payloads.into_values().collect();
            if let Err(err) = self.store.add_to_quota_and_tile_counts(
                &aggregate.tile_set,
                Quota::from_bytes(aggregate.delta_bytes),
                payloads,
            ) {
                warn!(
                    tile_set = %aggregate.tile_set.key(),
                    error = %err,
                    "failed to flush quota update"
                );
            }
        }

        if !batch.hit_payloads.is_empty() {
            let payloads: Vec<PageStatsPayload> =
                batch.hit_payloads.drain().map(|(_, p)| p).collect();
            if let Err(err) = self.store.add_hits_and_set_access_time(payloads).await {
                warn!(error = %err, "failed to flush usage statistics");
            }
        }

        batch.aggregated_events = 0;
        batch.oldest = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::TilePage;
    use crate::pyramid::{LevelCoverage, TileSetSource};
    use crate::store::QuotaStore;
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

    fn roads() -> TileSet {
        TileSet::new("roads", "EPSG:4326", "image/png", None)
    }

    async fn pipeline(
        dir: &TempDir,
    ) -> (
        QuotaStore,
        tokio::task::JoinHandle<()>,
        QuotaEventProducer,
        tokio::task::JoinHandle<()>,
        CancellationToken,
    ) {
        let calculator = Arc::new(TilePageCalculator::new(Arc::new(StaticConfig {
            tile_sets: vec![roads()],
        })));
        let (store, writer) =
            QuotaStore::open(dir.path(), Arc::clone(&calculator)).expect("store must open");
        let cancel = CancellationToken::new();
        let (producer, monitor) = QuotaUpdatesMonitor::new(
            store.clone(),
            calculator,
            1000,
            BackpressurePolicy::default(),
            cancel.clone(),
        );
        let consumer = tokio::spawn(monitor.run());
        (store, writer, producer, consumer, cancel)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Batching
    // ─────────────────────────────────────────────────────────────────────────

    #[test]
    fn empty_batch_never_flushes() {
        let batch = Batch::default();
        assert!(!batch.should_flush());
    }

    #[test]
    fn young_small_batch_waits() {
        let mut batch = Batch::default();
        batch.aggregated_events = 5;
        batch.oldest = Some(Instant::now());
        assert!(!batch.should_flush());
    }

    #[test]
    fn young_narrow_batch_waits_even_past_the_event_cap() {
        // Few distinct pages: the damper outranks the size trigger.
        let mut batch = Batch::default();
        batch.aggregated_events = MAX_AGGREGATES_BEFORE_COMMIT;
        batch.oldest = Some(Instant::now());
        assert!(!batch.should_flush());
    }

    #[test]
    fn wide_batch_flushes_after_sync_timeout() {
        let ts = roads();
        let mut batch = Batch::default();
        for i in 0..CAN_WAIT_MAX_PAGES as u32 {
            let page = TilePage::new(ts.key(), i, 0, 0);
            batch
                .hit_payloads
                .insert(page.key(), PageStatsPayload::new(page));
        }
        batch.aggregated_events = CAN_WAIT_MAX_PAGES;
        batch.oldest = Some(Instant::now() - 2 * DEFAULT_SYNC_TIMEOUT);
        assert!(batch.should_flush());
    }

    #[test]
    fn stale_batch_flushes() {
        let mut batch = Batch::default();
        batch.aggregated_events = 5;
        batch.oldest = Some(Instant::now() - CAN_WAIT_MAX_AGE);
        assert!(batch.should_flush());
    }

    // ─────────────────────────────────────────────────────────────────────────
    // End to end through the store
    // ─────────────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn stored_and_deleted_tiles_net_out() {
        let dir = TempDir::new().unwrap();
        let (store, writer, producer, consumer, cancel) = pipeline(&dir).await;
        let ts = roads();

        producer.tile_stored(&ts, 0, 0, 0, 4096).await;
        producer.tile_stored(&ts, 1, 0, 0, 4096).await;
        producer.tile_deleted(&ts, 1, 0, 0, 4096).await;

        cancel.cancel();
        consumer.await.unwrap();

        let global = store.get_globally_used_quota().await.unwrap();
        assert_eq!(global.bytes(), 4096);
        let layer = store.get_used_quota_by_layer_name("roads").await.unwrap();
        assert_eq!(layer.bytes(), 4096);

        store.close(writer).await;
    }

    #[tokio::test]
    async fn zero_sized_events_are_ignored() {
        let dir = TempDir::new().unwrap();
        let (store, writer, producer, consumer, cancel) = pipeline(&dir).await;
        let ts = roads();

        producer.tile_stored(&ts, 0, 0, 0, 0).await;
        producer.tile_deleted(&ts, 0, 0, 0, 0).await;

        cancel.cancel();
        consumer.await.unwrap();

        assert_eq!(store.get_globally_used_quota().await.unwrap().bytes(), 0);
        store.close(writer).await;
    }

    #[tokio::test]
    async fn hits_reach_the_page_statistics() {
        let dir = TempDir::new().unwrap();
        let (store, writer, producer, consumer, cancel) = pipeline(&dir).await;
        let ts = roads();

        producer.tile_stored(&ts, 0, 0, 0, 1024).await;
        for _ in 0..3 {
            producer.tile_hit(&ts, 0, 0, 0).await;
        }

        cancel.cancel();
        consumer.await.unwrap();

        let layers = vec!["roads".to_string()];
        let candidate = store
            .get_least_frequently_used_page(&layers)
            .await
            .unwrap()
            .expect("hit page must be tracked");
        assert_eq!(candidate.tile_set_id(), ts.key());

        store.close(writer).await;
    }

    #[tokio::test]
    async fn drop_policy_sheds_events_when_queue_is_full() {
        let (tx, rx) = mpsc::channel(1);
        let producer = QuotaEventProducer {
            tx,
            policy: BackpressurePolicy::DropAndLog,
        };
        let ts = roads();

        // Queue capacity 1 and no consumer: the second event must not hang.
        producer.tile_stored(&ts, 0, 0, 0, 100).await;
        producer.tile_stored(&ts, 1, 0, 0, 100).await;

        drop(rx);
    }
}
