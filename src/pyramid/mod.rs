//! Page addressing: mapping tile coordinates to pages and back.
//!
//! Each zoom level of a tile set is divided into fixed-size pages. The page
//! size along each axis grows with the logarithm of the level's tile count,
//! so low zooms get a handful of pages and high zooms get page counts that
//! stay manageable instead of exploding with the tile count.
//!
//! The math here is pure: coverage rectangles come from an external
//! [`TileSetSource`] and no grid/CRS logic lives in this module.

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;

use crate::page::TilePage;
use crate::tileset::TileSet;

/// Logarithm base for the page sizing heuristic. Found to give a decent
/// progression of page counts across zoom levels.
const PAGE_SIZE_LOG_BASE: f64 = 1.1;

/// Errors from page addressing.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PyramidError {
    /// Zoom level outside the tile set's configured range. A contract
    /// violation by the caller, not a recoverable condition.
    #[error("zoom level {zoom} outside configured range [{zoom_start}, {zoom_stop}]")]
    ZoomOutOfRange {
        zoom: u8,
        zoom_start: u8,
        zoom_stop: u8,
    },

    /// No coverage rectangle was supplied for a zoom level inside the
    /// configured range.
    #[error("no coverage supplied for zoom level {zoom}")]
    MissingCoverage { zoom: u8 },

    /// Tile coordinate below the level's coverage origin. The offset
    /// arithmetic would wrap, so the coordinate is rejected.
    #[error("tile ({x}, {y}) below coverage origin at zoom level {zoom}")]
    TileOutsideCoverage { x: u64, y: u64, zoom: u8 },

    /// The tile set is not known to the coverage source.
    #[error("unknown tile set: {tile_set_id}")]
    UnknownTileSet { tile_set_id: String },
}

/// Tile coverage of one zoom level, in tile-index units, bounds inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LevelCoverage {
    pub min_x: u64,
    pub min_y: u64,
    pub max_x: u64,
    pub max_y: u64,
    pub zoom: u8,
}

impl LevelCoverage {
    /// Number of tiles spanned along the X axis.
    pub fn tiles_wide(&self) -> u64 {
        1 + self.max_x - self.min_x
    }

    /// Number of tiles spanned along the Y axis.
    pub fn tiles_high(&self) -> u64 {
        1 + self.max_y - self.min_y
    }
}

/// Inclusive tile-coordinate rectangle at one zoom level, the unit handed
/// to the tile store when a page is truncated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileRange {
    pub min_x: u64,
    pub min_y: u64,
    pub max_x: u64,
    pub max_y: u64,
    pub zoom: u8,
}

impl TileRange {
    /// Whether the rectangle contains the given tile coordinate.
    pub fn contains(&self, x: u64, y: u64, zoom: u8) -> bool {
        zoom == self.zoom
            && x >= self.min_x
            && x <= self.max_x
            && y >= self.min_y
            && y <= self.max_y
    }
}

/// Page grid layout for one zoom level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageLevelInfo {
    pub pages_x: u32,
    pub pages_y: u32,
    pub tiles_per_page_x: u32,
    pub tiles_per_page_y: u32,
    pub coverage: LevelCoverage,
}

impl PageLevelInfo {
    /// Theoretical tile capacity of one page at this level.
    pub fn tiles_per_page(&self) -> u128 {
        u128::from(self.tiles_per_page_x) * u128::from(self.tiles_per_page_y)
    }
}

/// Per tile-set pyramid of page grids, one [`PageLevelInfo`] per zoom level.
///
/// Derived data: computed from coverage rectangles at construction, never
/// persisted, deterministic for the same input.
#[derive(Debug, Clone)]
pub struct PagePyramid {
    levels: BTreeMap<u8, PageLevelInfo>,
    zoom_start: u8,
    zoom_stop: u8,
}

impl PagePyramid {
    /// Build a pyramid from per-level coverage rectangles.
    ///
    /// Coverages outside `[zoom_start, zoom_stop]` are ignored.
    pub fn new(coverages: &[LevelCoverage], zoom_start: u8, zoom_stop: u8) -> Self {
        let levels = coverages
            .iter()
            .filter(|c| c.zoom >= zoom_start && c.zoom <= zoom_stop)
            .map(|c| (c.zoom, Self::calculate_level_info(*c)))
            .collect();
        Self {
            levels,
            zoom_start,
            zoom_stop,
        }
    }

    /// First zoom level covered.
    pub fn zoom_start(&self) -> u8 {
        self.zoom_start
    }

    /// Last zoom level covered (inclusive).
    pub fn zoom_stop(&self) -> u8 {
        self.zoom_stop
    }

    /// Page grid layout for `zoom`.
    pub fn page_info(&self, zoom: u8) -> Result<&PageLevelInfo, PyramidError> {
        if zoom < self.zoom_start || zoom > self.zoom_stop {
            return Err(PyramidError::ZoomOutOfRange {
                zoom,
                zoom_start: self.zoom_start,
                zoom_stop: self.zoom_stop,
            });
        }
        self.levels
            .get(&zoom)
            .ok_or(PyramidError::MissingCoverage { zoom })
    }

    /// Page coordinate of the page containing tile `(x, y)` at `zoom`.
    pub fn page_index_for_tile(
        &self,
        x: u64,
        y: u64,
        zoom: u8,
    ) -> Result<(u32, u32), PyramidError> {
        let info = self.page_info(zoom)?;
        if x < info.coverage.min_x || y < info.coverage.min_y {
            return Err(PyramidError::TileOutsideCoverage { x, y, zoom });
        }
        let page_x = ((x - info.coverage.min_x) / u64::from(info.tiles_per_page_x)) as u32;
        let page_y = ((y - info.coverage.min_y) / u64::from(info.tiles_per_page_y)) as u32;
        Ok((page_x, page_y))
    }

    /// Inclusive tile rectangle covered by page `(page_x, page_y)` at
    /// `zoom`. The inverse of [`page_index_for_tile`](Self::page_index_for_tile).
    pub fn tile_range_for_page(
        &self,
        page_x: u32,
        page_y: u32,
        zoom: u8,
    ) -> Result<TileRange, PyramidError> {
        let info = self.page_info(zoom)?;
        let min_x = info.coverage.min_x + u64::from(page_x) * u64::from(info.tiles_per_page_x);
        let min_y = info.coverage.min_y + u64::from(page_y) * u64::from(info.tiles_per_page_y);
        Ok(TileRange {
            min_x,
            min_y,
            max_x: min_x + u64::from(info.tiles_per_page_x) - 1,
            max_y: min_y + u64::from(info.tiles_per_page_y) - 1,
            zoom,
        })
    }

    fn calculate_level_info(coverage: LevelCoverage) -> PageLevelInfo {
        let tiles_wide = coverage.tiles_wide();
        let tiles_high = coverage.tiles_high();

        let tiles_per_page_x = tiles_per_page_for_axis(tiles_wide);
        let tiles_per_page_y = tiles_per_page_for_axis(tiles_high);
        let pages_x = tiles_wide.div_ceil(u64::from(tiles_per_page_x)) as u32;
        let pages_y = tiles_high.div_ceil(u64::from(tiles_per_page_y)) as u32;

        PageLevelInfo {
            pages_x,
            pages_y,
            tiles_per_page_x,
            tiles_per_page_y,
            coverage,
        }
    }
}

/// Tiles per page along one axis: `ceil(n / log_1.1(n))`, special-casing a
/// single-tile axis (log(1) is zero).
fn tiles_per_page_for_axis(num_tiles_in_axis: u64) -> u32 {
    if num_tiles_in_axis == 1 {
        return 1;
    }
    let log = (num_tiles_in_axis as f64).ln() / PAGE_SIZE_LOG_BASE.ln();
    (num_tiles_in_axis as f64 / log).ceil() as u32
}

/// External provider of tile-set configuration and grid coverage.
///
/// Implemented by the grid subsystem; this crate only consumes the
/// per-level coverage rectangles.
pub trait TileSetSource: Send + Sync {
    /// Names of all currently configured layers.
    fn layer_names(&self) -> Vec<String>;

    /// All tile sets configured for a layer (gridset × format × parameters
    /// combinations).
    fn tile_sets_for(&self, layer_name: &str) -> Vec<TileSet>;

    /// Zoom range and per-level coverages for a tile set, or `None` if the
    /// tile set is not configured.
    fn coverage_of(&self, tile_set: &TileSet) -> Option<(u8, u8, Vec<LevelCoverage>)>;
}

/// Organizes tiles into pages for quota accounting.
///
/// Caches one [`PagePyramid`] per tile set; call
/// [`invalidate`](Self::invalidate) when the grid configuration changes.
pub struct TilePageCalculator {
    source: Arc<dyn TileSetSource>,
    pyramids: DashMap<String, Arc<PagePyramid>>,
}

impl TilePageCalculator {
    /// Create a calculator backed by the given coverage source.
    pub fn new(source: Arc<dyn TileSetSource>) -> Self {
        Self {
            source,
            pyramids: DashMap::new(),
        }
    }

    /// Names of all configured layers.
    pub fn layer_names(&self) -> Vec<String> {
        self.source.layer_names()
    }

    /// All tile sets configured for a layer.
    pub fn tile_sets_for(&self, layer_name: &str) -> Vec<TileSet> {
        self.source.tile_sets_for(layer_name)
    }

    /// The page containing tile `(x, y)` at `zoom` within the tile set.
    pub fn page_for_tile(
        &self,
        tile_set: &TileSet,
        x: u64,
        y: u64,
        zoom: u8,
    ) -> Result<TilePage, PyramidError> {
        let pyramid = self.pyramid(tile_set)?;
        let (page_x, page_y) = pyramid.page_index_for_tile(x, y, zoom)?;
        Ok(TilePage::new(tile_set.key(), page_x, page_y, zoom))
    }

    /// Theoretical tile capacity of a page at `zoom` in the tile set.
    pub fn tiles_per_page(&self, tile_set: &TileSet, zoom: u8) -> Result<u128, PyramidError> {
        let pyramid = self.pyramid(tile_set)?;
        Ok(pyramid.page_info(zoom)?.tiles_per_page())
    }

    /// Tile rectangle covered by a page, for truncation in the tile store.
    pub fn tile_range_for_page(
        &self,
        tile_set: &TileSet,
        page: &TilePage,
    ) -> Result<TileRange, PyramidError> {
        let pyramid = self.pyramid(tile_set)?;
        pyramid.tile_range_for_page(page.page_x(), page.page_y(), page.zoom_level())
    }

    /// Drop the cached pyramid for a tile set (grid configuration changed).
    pub fn invalidate(&self, tile_set: &TileSet) {
        self.pyramids.remove(tile_set.key());
    }

    /// Drop all cached pyramids.
    pub fn invalidate_all(&self) {
        self.pyramids.clear();
    }

    fn pyramid(&self, tile_set: &TileSet) -> Result<Arc<PagePyramid>, PyramidError> {
        if let Some(pyramid) = self.pyramids.get(tile_set.key()) {
            return Ok(Arc::clone(&pyramid));
        }
        let (zoom_start, zoom_stop, coverages) =
            self.source
                .coverage_of(tile_set)
                .ok_or_else(|| PyramidError::UnknownTileSet {
                    tile_set_id: tile_set.key().to_string(),
                })?;
        let pyramid = Arc::new(PagePyramid::new(&coverages, zoom_start, zoom_stop));
        self.pyramids
            .insert(tile_set.key().to_string(), Arc::clone(&pyramid));
        Ok(pyramid)
    }
}
