//! Tile pages and their usage statistics.
//!
//! A page is a rectangular block of tiles within one zoom level of one tile
//! set, the unit at which usage is accounted and eviction happens. Pages are
//! created lazily the first time any tile inside them is touched; their
//! statistics drive the LRU/LFU expiration policies.

use std::fmt;

use crate::time::current_time_minutes;

/// Rounding precision for the fill factor and frequency statistics.
///
/// Deltas are rounded up at the 7th decimal so that repeated small updates
/// never lose a page's last fraction of a tile to truncation.
const STAT_PRECISION: f64 = 1e7;

/// Ceiling-round `value` at [`STAT_PRECISION`] decimals.
fn ceil_at_precision(value: f64) -> f64 {
    (value * STAT_PRECISION).ceil() / STAT_PRECISION
}

/// Identity of one tile page.
///
/// The canonical key is `tileSetId@pageX,pageY,zoomLevel`. The creation
/// timestamp is the baseline for the frequency-of-use computation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TilePage {
    tile_set_id: String,
    page_x: u32,
    page_y: u32,
    zoom_level: u8,
    creation_time_minutes: u32,
}

impl TilePage {
    /// A page created now.
    pub fn new(tile_set_id: impl Into<String>, page_x: u32, page_y: u32, zoom_level: u8) -> Self {
        Self {
            tile_set_id: tile_set_id.into(),
            page_x,
            page_y,
            zoom_level,
            creation_time_minutes: current_time_minutes(),
        }
    }

    /// A page with an explicit creation timestamp, used when copying pages
    /// across tile sets (rename) so frequency baselines survive.
    pub fn with_creation_time(
        tile_set_id: impl Into<String>,
        page_x: u32,
        page_y: u32,
        zoom_level: u8,
        creation_time_minutes: u32,
    ) -> Self {
        Self {
            tile_set_id: tile_set_id.into(),
            page_x,
            page_y,
            zoom_level,
            creation_time_minutes,
        }
    }

    /// Canonical page key: `tileSetId@pageX,pageY,zoomLevel`.
    pub fn key(&self) -> String {
        Self::compute_key(&self.tile_set_id, self.page_x, self.page_y, self.zoom_level)
    }

    /// Build a page key without constructing a page.
    pub fn compute_key(tile_set_id: &str, page_x: u32, page_y: u32, zoom_level: u8) -> String {
        format!("{}@{},{},{}", tile_set_id, page_x, page_y, zoom_level)
    }

    /// Key of the owning tile set.
    pub fn tile_set_id(&self) -> &str {
        &self.tile_set_id
    }

    /// Page column within the level's page grid.
    pub fn page_x(&self) -> u32 {
        self.page_x
    }

    /// Page row within the level's page grid.
    pub fn page_y(&self) -> u32 {
        self.page_y
    }

    /// Zoom level this page belongs to.
    pub fn zoom_level(&self) -> u8 {
        self.zoom_level
    }

    /// Creation time in minutes since the epoch.
    pub fn creation_time_minutes(&self) -> u32 {
        self.creation_time_minutes
    }
}

impl fmt::Display for TilePage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{},{},{}",
            self.tile_set_id, self.page_x, self.page_y, self.zoom_level
        )
    }
}

/// Accumulated usage statistics for one tile page.
///
/// One-to-one with a [`TilePage`]; never deleted individually, cascades with
/// its page.
#[derive(Debug, Clone, PartialEq)]
pub struct PageStats {
    page_key: String,
    fill_factor: f32,
    frequency_of_use: f32,
    last_access_time_minutes: u32,
    num_hits: u128,
}

impl PageStats {
    /// Fresh statistics for a page: empty, never hit, accessed "now".
    pub fn new(page_key: impl Into<String>) -> Self {
        Self {
            page_key: page_key.into(),
            fill_factor: 0.0,
            frequency_of_use: 0.0,
            last_access_time_minutes: current_time_minutes(),
            num_hits: 0,
        }
    }

    /// Key of the page these statistics belong to.
    pub fn page_key(&self) -> &str {
        &self.page_key
    }

    /// Re-target these statistics to a different page key (layer rename).
    pub fn set_page_key(&mut self, page_key: impl Into<String>) {
        self.page_key = page_key.into();
    }

    /// Fraction of the page's estimated tile capacity currently stored,
    /// in `[0, 1]`.
    pub fn fill_factor(&self) -> f32 {
        self.fill_factor
    }

    /// Force the fill factor, used when a page has been truncated.
    pub fn set_fill_factor(&mut self, fill_factor: f32) {
        self.fill_factor = fill_factor;
    }

    /// Smoothed hits-per-minute statistic, the LFU ordering key.
    pub fn frequency_of_use(&self) -> f32 {
        self.frequency_of_use
    }

    /// Minutes-since-epoch of the last recorded hit, the LRU ordering key.
    pub fn last_access_time_minutes(&self) -> u32 {
        self.last_access_time_minutes
    }

    /// Cumulative hit count over the page's lifetime.
    pub fn num_hits(&self) -> u128 {
        self.num_hits
    }

    /// Apply a tile-count delta against the page's capacity.
    ///
    /// The fill factor moves by `num_tiles / tiles_per_page` and is clamped
    /// to `[0, 1]`. A full page swallows further increases and an empty page
    /// swallows further decreases; the capacity estimate is approximate, so
    /// counting past the boundary would only amplify the error. This keeps
    /// the original engine's saturating behavior, which can under-count when
    /// the capacity estimate was low.
    pub fn add_tiles(&mut self, num_tiles: i64, tiles_per_page: u128) {
        if self.fill_factor == 1.0 && num_tiles >= 0 {
            return;
        }
        if self.fill_factor == 0.0 && num_tiles <= 0 {
            return;
        }
        let delta = ceil_at_precision(num_tiles as f64 / tiles_per_page as f64);
        let updated = self.fill_factor as f64 + delta;
        self.fill_factor = updated.clamp(0.0, 1.0) as f32;
    }

    /// Record `added_hits` hits observed at `last_access_time_minutes` and
    /// recompute the frequency of use.
    ///
    /// Frequency is cumulative hits over the page's age in minutes, scaled
    /// by the fill factor; an access time earlier than the creation time is
    /// clamped to the creation time so ages never go negative.
    pub fn add_hits_and_access_time(
        &mut self,
        added_hits: u64,
        last_access_time_minutes: u32,
        creation_time_minutes: u32,
    ) {
        let last_access = last_access_time_minutes.max(creation_time_minutes);

        if self.fill_factor <= 0.0 {
            // Hits recorded before the matching quota increase landed; give
            // the page a nonzero weight so the LFU ordering still sees it.
            self.fill_factor = f32::MIN_POSITIVE;
        }

        self.num_hits += u128::from(added_hits);
        let age_minutes = 1 + u64::from(last_access - creation_time_minutes);
        let hits_per_minute = ceil_at_precision(self.num_hits as f64 / age_minutes as f64);

        self.frequency_of_use = (hits_per_minute * self.fill_factor as f64) as f32;
        self.last_access_time_minutes = last_access;
    }
}

/// A batched delta for one page, produced by the update pipeline and applied
/// by the store in a single transaction.
#[derive(Debug, Clone)]
pub struct PageStatsPayload {
    page: TilePage,
    num_tiles: i64,
    num_hits: u64,
    last_access_time_millis: u64,
}

impl PageStatsPayload {
    /// An empty payload for the given page.
    pub fn new(page: TilePage) -> Self {
        Self {
            page,
            num_tiles: 0,
            num_hits: 0,
            last_access_time_millis: 0,
        }
    }

    /// The page this payload targets.
    pub fn page(&self) -> &TilePage {
        &self.page
    }

    /// Net tile-count change (stores minus deletes).
    pub fn num_tiles(&self) -> i64 {
        self.num_tiles
    }

    /// Set the net tile-count change.
    pub fn set_num_tiles(&mut self, num_tiles: i64) {
        self.num_tiles = num_tiles;
    }

    /// Accumulated read hits.
    pub fn num_hits(&self) -> u64 {
        self.num_hits
    }

    /// Add read hits observed at `access_time_millis` (epoch milliseconds).
    pub fn add_hits(&mut self, hits: u64, access_time_millis: u64) {
        self.num_hits += hits;
        self.last_access_time_millis = self.last_access_time_millis.max(access_time_millis);
    }

    /// Epoch milliseconds of the latest aggregated access.
    pub fn last_access_time_millis(&self) -> u64 {
        self.last_access_time_millis
    }
}
