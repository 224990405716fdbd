//! Primary tables and secondary indexes behind the quota store.
//!
//! Only the store's writer task touches these tables, so every method runs
//! single-threaded. Methods validate their whole input before mutating
//! anything, which is what makes a failed operation leave the tables
//! untouched.
//!
//! Relationships are explicit keys, never back-pointers: a page carries its
//! tile set's key, page statistics carry their page's key, and the ordered
//! eviction indexes map `(ordering key, page key)` pairs back to pages.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use crate::page::{PageStats, PageStatsPayload, TilePage};
use crate::quota::Quota;
use crate::tileset::{TileSet, GLOBAL_QUOTA_ID};
use crate::time::millis_to_minutes;

use super::StoreError;

/// Frequency-of-use as an ordered index key.
///
/// `f32` has no total order; `total_cmp` gives one, and bit equality matches
/// it, which is all the `BTreeSet` needs.
#[derive(Debug, Clone, Copy)]
pub(super) struct FrequencyKey(f32);

impl PartialEq for FrequencyKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.to_bits() == other.0.to_bits()
    }
}

impl Eq for FrequencyKey {}

impl PartialOrd for FrequencyKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FrequencyKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.total_cmp(&other.0)
    }
}

/// A tile set together with its accumulated usage.
#[derive(Debug, Clone)]
pub(super) struct TileSetRecord {
    pub tile_set: TileSet,
    pub used: Quota,
}

/// A page-stats delta with its capacity denominator already resolved, ready
/// to apply.
pub(super) struct ResolvedPayload {
    pub payload: PageStatsPayload,
    pub tiles_per_page: u128,
}

/// The store's tables: tile sets (including the global sentinel row), pages,
/// per-page statistics, and the secondary indexes that serve layer lookups
/// and the LRU/LFU candidate scans.
#[derive(Debug, Default)]
pub(super) struct StoreTables {
    tile_sets: BTreeMap<String, TileSetRecord>,
    pages: BTreeMap<String, TilePage>,
    page_stats: BTreeMap<String, PageStats>,
    pages_by_tile_set: BTreeMap<String, BTreeSet<String>>,
    by_last_access: BTreeSet<(u32, String)>,
    by_frequency: BTreeSet<(FrequencyKey, String)>,
}

impl StoreTables {
    pub fn new() -> Self {
        let mut tables = Self::default();
        tables.tile_sets.insert(
            GLOBAL_QUOTA_ID.to_string(),
            TileSetRecord {
                tile_set: TileSet::global(),
                used: Quota::new(),
            },
        );
        tables
    }

    // ── tile sets ────────────────────────────────────────────────────────────

    /// Create a tile set with zero usage if absent. Returns whether a new
    /// record was created.
    pub fn create_tile_set(&mut self, tile_set: TileSet) -> bool {
        let key = tile_set.key().to_string();
        if self.tile_sets.contains_key(&key) {
            return false;
        }
        self.tile_sets.insert(
            key,
            TileSetRecord {
                tile_set,
                used: Quota::new(),
            },
        );
        true
    }

    pub fn tile_set_by_id(&self, id: &str) -> Result<&TileSetRecord, StoreError> {
        self.tile_sets
            .get(id)
            .ok_or_else(|| StoreError::TileSetNotFound(id.to_string()))
    }

    /// All tile sets except the global sentinel.
    pub fn tile_sets(&self) -> Vec<TileSet> {
        self.tile_sets
            .values()
            .filter(|r| !r.tile_set.is_global())
            .map(|r| r.tile_set.clone())
            .collect()
    }

    /// Delete every tile set matching `predicate`, cascading pages and
    /// statistics, and subtract the removed usage from the global aggregate.
    /// Returns the total usage removed.
    pub fn delete_tile_sets_where<F>(&mut self, predicate: F) -> Quota
    where
        F: Fn(&TileSet) -> bool,
    {
        let doomed: Vec<String> = self
            .tile_sets
            .values()
            .filter(|r| !r.tile_set.is_global() && predicate(&r.tile_set))
            .map(|r| r.tile_set.key().to_string())
            .collect();

        let mut removed = Quota::new();
        for key in doomed {
            if let Some(record) = self.tile_sets.remove(&key) {
                removed.add(&record.used);
                self.drop_pages_of(&key);
            }
        }
        if let Some(global) = self.tile_sets.get_mut(GLOBAL_QUOTA_ID) {
            global.used.subtract(&removed);
        }
        removed
    }

    /// Move every tile set of `old_layer` under `new_layer`, carrying usage,
    /// pages and statistics. Aggregate totals are unchanged; when the target
    /// layer already has a matching tile set, the two usages are merged so
    /// the global aggregate stays equal to the per-tile-set sum.
    pub fn rename_layer(&mut self, old_layer: &str, new_layer: &str) {
        let doomed: Vec<String> = self
            .tile_sets
            .values()
            .filter(|r| !r.tile_set.is_global() && r.tile_set.layer_name() == old_layer)
            .map(|r| r.tile_set.key().to_string())
            .collect();

        for old_key in doomed {
            let record = match self.tile_sets.remove(&old_key) {
                Some(record) => record,
                None => continue,
            };
            let renamed = TileSet::new(
                new_layer,
                record.tile_set.gridset_id(),
                record.tile_set.blob_format(),
                record.tile_set.parameters_id().map(str::to_string),
            );
            let new_key = renamed.key().to_string();

            let page_keys = self
                .pages_by_tile_set
                .remove(&old_key)
                .unwrap_or_default();
            for old_page_key in page_keys {
                let page = match self.pages.remove(&old_page_key) {
                    Some(page) => page,
                    None => continue,
                };
                let moved = TilePage::with_creation_time(
                    new_key.clone(),
                    page.page_x(),
                    page.page_y(),
                    page.zoom_level(),
                    page.creation_time_minutes(),
                );
                let new_page_key = moved.key();

                if let Some(mut stats) = self.page_stats.remove(&old_page_key) {
                    self.unindex(&old_page_key, &stats);
                    // A colliding page on the target layer gives way to the
                    // moved one; its index entries must not go stale.
                    if let Some(displaced) = self.page_stats.remove(&new_page_key) {
                        self.unindex(&new_page_key, &displaced);
                    }
                    stats.set_page_key(new_page_key.clone());
                    self.index(&new_page_key, &stats);
                    self.page_stats.insert(new_page_key.clone(), stats);
                }
                self.pages.insert(new_page_key.clone(), moved);
                self.pages_by_tile_set
                    .entry(new_key.clone())
                    .or_default()
                    .insert(new_page_key);
            }

            let mut used = record.used;
            if let Some(existing) = self.tile_sets.remove(&new_key) {
                used.add(&existing.used);
            }
            self.tile_sets.insert(
                new_key,
                TileSetRecord {
                    tile_set: renamed,
                    used,
                },
            );
        }
    }

    // ── accounting ───────────────────────────────────────────────────────────

    /// Apply one accounting transaction: the byte delta lands on both the
    /// tile set's aggregate and the global aggregate, then each page delta
    /// moves its page's fill factor. Creates the tile set and pages lazily.
    pub fn add_to_quota_and_tile_counts(
        &mut self,
        tile_set: &TileSet,
        delta_bytes: i128,
        payloads: Vec<ResolvedPayload>,
    ) {
        self.create_tile_set(tile_set.clone());

        let key = tile_set.key().to_string();
        if let Some(record) = self.tile_sets.get_mut(&key) {
            record.used.add_bytes(delta_bytes);
        }
        if let Some(global) = self.tile_sets.get_mut(GLOBAL_QUOTA_ID) {
            global.used.add_bytes(delta_bytes);
        }

        for resolved in payloads {
            let page_key = self.get_or_create_page(resolved.payload.page());
            let mut stats = self
                .page_stats
                .remove(&page_key)
                .unwrap_or_else(|| PageStats::new(page_key.clone()));
            self.unindex(&page_key, &stats);
            stats.add_tiles(resolved.payload.num_tiles(), resolved.tiles_per_page);
            self.index(&page_key, &stats);
            self.page_stats.insert(page_key, stats);
        }
    }

    /// Record read hits: accumulate the hit count, move the access time
    /// forward and recompute the frequency of use. Returns snapshots of the
    /// updated statistics.
    pub fn add_hits_and_set_access_time(
        &mut self,
        payloads: Vec<PageStatsPayload>,
    ) -> Vec<PageStats> {
        let mut snapshots = Vec::with_capacity(payloads.len());
        for payload in payloads {
            let page_key = self.get_or_create_page(payload.page());
            let creation = self
                .pages
                .get(&page_key)
                .map(TilePage::creation_time_minutes)
                .unwrap_or_default();

            let mut stats = self
                .page_stats
                .remove(&page_key)
                .unwrap_or_else(|| PageStats::new(page_key.clone()));
            self.unindex(&page_key, &stats);
            stats.add_hits_and_access_time(
                payload.num_hits(),
                millis_to_minutes(payload.last_access_time_millis()),
                creation,
            );
            self.index(&page_key, &stats);
            snapshots.push(stats.clone());
            self.page_stats.insert(page_key, stats);
        }
        snapshots
    }

    /// Reset a page's fill factor after its tiles were physically removed.
    /// The byte delta from those deletions arrives separately through the
    /// normal accounting path. Unknown pages are a no-op.
    pub fn set_truncated(&mut self, page_key: &str) {
        if let Some(mut stats) = self.page_stats.remove(page_key) {
            self.unindex(page_key, &stats);
            stats.set_fill_factor(0.0);
            self.index(page_key, &stats);
            self.page_stats.insert(page_key.to_string(), stats);
        }
    }

    // ── queries ──────────────────────────────────────────────────────────────

    pub fn used_quota_by_tile_set_id(&self, id: &str) -> Result<Quota, StoreError> {
        Ok(self.tile_set_by_id(id)?.used.clone())
    }

    /// Sum of usage over all tile sets of a layer. A layer with no tile sets
    /// reports zero.
    pub fn used_quota_by_layer(&self, layer_name: &str) -> Quota {
        let mut total = Quota::new();
        for record in self.tile_sets.values() {
            if !record.tile_set.is_global() && record.tile_set.layer_name() == layer_name {
                total.add(&record.used);
            }
        }
        total
    }

    pub fn globally_used_quota(&self) -> Quota {
        self.tile_sets
            .get(GLOBAL_QUOTA_ID)
            .map(|r| r.used.clone())
            .unwrap_or_default()
    }

    /// First page in ascending last-access order with a nonzero fill factor
    /// whose layer is in `layers`. Streams the index, stopping at the first
    /// match.
    pub fn least_recently_used_page(&self, layers: &HashSet<&str>) -> Option<TilePage> {
        self.first_eligible(self.by_last_access.iter().map(|(_, key)| key), layers)
    }

    /// First page in ascending frequency-of-use order with a nonzero fill
    /// factor whose layer is in `layers`.
    pub fn least_frequently_used_page(&self, layers: &HashSet<&str>) -> Option<TilePage> {
        self.first_eligible(self.by_frequency.iter().map(|(_, key)| key), layers)
    }

    fn first_eligible<'a>(
        &self,
        ordered_page_keys: impl Iterator<Item = &'a String>,
        layers: &HashSet<&str>,
    ) -> Option<TilePage> {
        for page_key in ordered_page_keys {
            let stats = match self.page_stats.get(page_key) {
                Some(stats) => stats,
                None => continue,
            };
            if stats.fill_factor() <= 0.0 {
                continue;
            }
            let page = match self.pages.get(page_key) {
                Some(page) => page,
                None => continue,
            };
            let layer = TileSet::layer_name_from_key(page.tile_set_id());
            if layers.contains(layer) {
                return Some(page.clone());
            }
        }
        None
    }

    // ── page bookkeeping ─────────────────────────────────────────────────────

    fn get_or_create_page(&mut self, page: &TilePage) -> String {
        let page_key = page.key();
        if !self.pages.contains_key(&page_key) {
            self.pages.insert(page_key.clone(), page.clone());
            self.pages_by_tile_set
                .entry(page.tile_set_id().to_string())
                .or_default()
                .insert(page_key.clone());
        }
        page_key
    }

    fn drop_pages_of(&mut self, tile_set_key: &str) {
        let page_keys = self
            .pages_by_tile_set
            .remove(tile_set_key)
            .unwrap_or_default();
        for page_key in page_keys {
            self.pages.remove(&page_key);
            if let Some(stats) = self.page_stats.remove(&page_key) {
                self.unindex(&page_key, &stats);
            }
        }
    }

    fn index(&mut self, page_key: &str, stats: &PageStats) {
        self.by_last_access
            .insert((stats.last_access_time_minutes(), page_key.to_string()));
        self.by_frequency
            .insert((FrequencyKey(stats.frequency_of_use()), page_key.to_string()));
    }

    fn unindex(&mut self, page_key: &str, stats: &PageStats) {
        self.by_last_access
            .remove(&(stats.last_access_time_minutes(), page_key.to_string()));
        self.by_frequency
            .remove(&(FrequencyKey(stats.frequency_of_use()), page_key.to_string()));
    }
}
