//! The transactional accounting engine.
//!
//! [`QuotaStore`] tracks how much storage every tile set consumes, keeps the
//! global aggregate in step with the per-tile-set aggregates, maintains
//! per-page usage statistics and answers the LRU/LFU candidate queries that
//! drive eviction.
//!
//! All mutations funnel through one writer task over an mpsc channel, so
//! commands execute in strict submission order and no locking is needed on
//! the tables. Callers either await a reply (`issue_sync` operations such as
//! [`QuotaStore::create_layer`]) or fire and forget (`issue` operations such
//! as the ordinary accounting deltas), mirroring which operations need
//! consistency before returning and which favor latency.

mod tables;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::page::{PageStats, PageStatsPayload, TilePage};
use crate::pyramid::{PyramidError, TilePageCalculator, TileRange};
use crate::quota::Quota;
use crate::tileset::TileSet;

use tables::{ResolvedPayload, StoreTables};

/// On-disk layout version this build reads and writes.
const STORE_VERSION: &str = "1.1";

/// Name of the version marker file inside the store directory.
const VERSION_FILE: &str = "version.txt";

/// Bound on how long [`QuotaStore::close`] waits for queued commands to
/// drain.
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Fatal startup errors. The store never reaches the open state when one of
/// these occurs.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The store directory was written by an incompatible version.
    #[error("quota store layout version mismatch in {path}: found {found:?}, expected {expected:?}")]
    VersionMismatch {
        path: PathBuf,
        found: String,
        expected: String,
    },

    /// The store directory could not be created or read.
    #[error("cannot access quota store directory {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Runtime store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store has shut down; no further commands are accepted.
    #[error("quota store is closed")]
    Closed,

    /// The writer task went away before replying. The command's fate is
    /// unknown to the caller.
    #[error("quota store writer terminated before replying")]
    Interrupted,

    /// Query for a tile set id that does not exist. Distinct from zero
    /// usage: a tile set with zero usage still exists.
    #[error("tile set does not exist: {0}")]
    TileSetNotFound(String),

    /// Page addressing failed for a tile set's coverage.
    #[error(transparent)]
    Pyramid(#[from] PyramidError),
}

enum Command {
    CreateLayer {
        layer: String,
        reply: oneshot::Sender<()>,
    },
    DeleteLayer {
        layer: String,
    },
    DeleteGridSubset {
        layer: String,
        gridset_id: String,
        reply: oneshot::Sender<()>,
    },
    DeleteParameters {
        layer: String,
        parameters_id: String,
        reply: oneshot::Sender<()>,
    },
    RenameLayer {
        old_layer: String,
        new_layer: String,
        reply: oneshot::Sender<()>,
    },
    AddToQuotaAndTileCounts {
        tile_set: TileSet,
        delta_bytes: i128,
        payloads: Vec<PageStatsPayload>,
    },
    AddHitsAndSetAccessTime {
        payloads: Vec<PageStatsPayload>,
        reply: oneshot::Sender<Vec<PageStats>>,
    },
    SetTruncated {
        page_key: String,
        reply: oneshot::Sender<()>,
    },
    GetTileSetById {
        id: String,
        reply: oneshot::Sender<Result<TileSet, StoreError>>,
    },
    GetUsedQuotaByTileSetId {
        id: String,
        reply: oneshot::Sender<Result<Quota, StoreError>>,
    },
    GetUsedQuotaByLayerName {
        layer: String,
        reply: oneshot::Sender<Quota>,
    },
    GetGloballyUsedQuota {
        reply: oneshot::Sender<Quota>,
    },
    GetLeastRecentlyUsedPage {
        layers: Vec<String>,
        reply: oneshot::Sender<Option<TilePage>>,
    },
    GetLeastFrequentlyUsedPage {
        layers: Vec<String>,
        reply: oneshot::Sender<Option<TilePage>>,
    },
    TileSets {
        reply: oneshot::Sender<Vec<TileSet>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to the quota store. Cheap to clone; all clones talk to the same
/// writer task.
#[derive(Clone)]
pub struct QuotaStore {
    tx: mpsc::UnboundedSender<Command>,
    calculator: Arc<TilePageCalculator>,
}

impl QuotaStore {
    /// Open the store: verify the on-disk layout version, seed the tables
    /// with the configured layers and start the writer task.
    ///
    /// An empty directory is initialized with the current version marker; a
    /// marker from an incompatible version is fatal.
    ///
    /// # Arguments
    ///
    /// * `store_directory` - Directory holding the version marker.
    /// * `calculator` - Page addressing for the configured tile sets.
    ///
    /// # Returns
    ///
    /// The open store and a join handle for its writer task.
    pub fn open(
        store_directory: &Path,
        calculator: Arc<TilePageCalculator>,
    ) -> Result<(Self, JoinHandle<()>), ConfigError> {
        check_version_marker(store_directory)?;

        let mut tables = StoreTables::new();
        for layer in calculator.layer_names() {
            for tile_set in calculator.tile_sets_for(&layer) {
                if tables.create_tile_set(tile_set.clone()) {
                    debug!(tile_set = %tile_set.key(), "created tile set at startup");
                }
            }
        }
        info!(
            path = %store_directory.display(),
            tile_sets = tables.tile_sets().len(),
            "quota store open"
        );

        let (tx, rx) = mpsc::unbounded_channel();
        let writer_calculator = Arc::clone(&calculator);
        let writer = tokio::spawn(run_writer(rx, tables, writer_calculator));

        Ok((Self { tx, calculator }, writer))
    }

    /// Shut down the writer, draining queued commands first. Waits at most
    /// [`SHUTDOWN_DRAIN_TIMEOUT`]; on timeout the writer is left to finish
    /// in the background and a warning is logged.
    pub async fn close(self, writer: JoinHandle<()>) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::Shutdown { reply }).is_ok() {
            let _ = rx.await;
        }
        drop(self.tx);
        match tokio::time::timeout(SHUTDOWN_DRAIN_TIMEOUT, writer).await {
            Ok(_) => info!("quota store closed"),
            Err(_) => warn!(
                timeout_secs = SHUTDOWN_DRAIN_TIMEOUT.as_secs(),
                "quota store writer did not drain before timeout"
            ),
        }
    }

    /// Names of all configured layers.
    pub fn layer_names(&self) -> Vec<String> {
        self.calculator.layer_names()
    }

    /// Ensure a tile set with zero usage exists for every gridset and format
    /// combination configured for the layer. Idempotent.
    pub async fn create_layer(&self, layer: &str) -> Result<(), StoreError> {
        self.issue_sync(|reply| Command::CreateLayer {
            layer: layer.to_string(),
            reply,
        })
        .await
    }

    /// Remove all tile sets of a layer, cascading pages and statistics, and
    /// subtract their usage from the global aggregate. Fire-and-forget: the
    /// deletion completes behind later reads.
    pub fn delete_layer(&self, layer: &str) -> Result<(), StoreError> {
        self.issue(Command::DeleteLayer {
            layer: layer.to_string(),
        })
    }

    /// Remove all tile sets of a layer on one gridset.
    pub async fn delete_grid_subset(
        &self,
        layer: &str,
        gridset_id: &str,
    ) -> Result<(), StoreError> {
        self.issue_sync(|reply| Command::DeleteGridSubset {
            layer: layer.to_string(),
            gridset_id: gridset_id.to_string(),
            reply,
        })
        .await
    }

    /// Remove all tile sets of a layer carrying the given parameters id.
    pub async fn delete_parameters(
        &self,
        layer: &str,
        parameters_id: &str,
    ) -> Result<(), StoreError> {
        self.issue_sync(|reply| Command::DeleteParameters {
            layer: layer.to_string(),
            parameters_id: parameters_id.to_string(),
            reply,
        })
        .await
    }

    /// Move every tile set of `old_layer` under `new_layer`, carrying usage,
    /// pages and statistics. Total usage is conserved.
    pub async fn rename_layer(&self, old_layer: &str, new_layer: &str) -> Result<(), StoreError> {
        self.issue_sync(|reply| Command::RenameLayer {
            old_layer: old_layer.to_string(),
            new_layer: new_layer.to_string(),
            reply,
        })
        .await
    }

    /// The single mutating entry point for ordinary tile writes and deletes:
    /// a byte delta for the tile set (and the global aggregate) plus any
    /// number of per-page tile-count deltas, applied as one transaction.
    /// Fire-and-forget.
    pub fn add_to_quota_and_tile_counts(
        &self,
        tile_set: &TileSet,
        quota_delta: Quota,
        payloads: Vec<PageStatsPayload>,
    ) -> Result<(), StoreError> {
        self.issue(Command::AddToQuotaAndTileCounts {
            tile_set: tile_set.clone(),
            delta_bytes: quota_delta.bytes(),
            payloads,
        })
    }

    /// Record read hits against pages and refresh their access time and
    /// frequency of use. Returns snapshots of the updated statistics.
    pub async fn add_hits_and_set_access_time(
        &self,
        payloads: Vec<PageStatsPayload>,
    ) -> Result<Vec<PageStats>, StoreError> {
        self.issue_sync(|reply| Command::AddHitsAndSetAccessTime { payloads, reply })
            .await
    }

    /// Reset a page's fill factor to zero after its tiles were removed from
    /// the tile store. Quota deltas from those deletions arrive separately.
    pub async fn set_truncated(&self, page: &TilePage) -> Result<(), StoreError> {
        self.issue_sync(|reply| Command::SetTruncated {
            page_key: page.key(),
            reply,
        })
        .await
    }

    /// Look up a tile set by its canonical key.
    pub async fn get_tile_set_by_id(&self, id: &str) -> Result<TileSet, StoreError> {
        self.issue_sync(|reply| Command::GetTileSetById {
            id: id.to_string(),
            reply,
        })
        .await?
    }

    /// Usage of one tile set. Errors with [`StoreError::TileSetNotFound`]
    /// when the id is unknown; an existing tile set with no usage reports a
    /// zero quota.
    pub async fn get_used_quota_by_tile_set_id(&self, id: &str) -> Result<Quota, StoreError> {
        self.issue_sync(|reply| Command::GetUsedQuotaByTileSetId {
            id: id.to_string(),
            reply,
        })
        .await?
    }

    /// Summed usage over all tile sets of a layer.
    pub async fn get_used_quota_by_layer_name(&self, layer: &str) -> Result<Quota, StoreError> {
        self.issue_sync(|reply| Command::GetUsedQuotaByLayerName {
            layer: layer.to_string(),
            reply,
        })
        .await
    }

    /// Usage summed over all tile sets.
    pub async fn get_globally_used_quota(&self) -> Result<Quota, StoreError> {
        self.issue_sync(|reply| Command::GetGloballyUsedQuota { reply })
            .await
    }

    /// Least recently used page with a nonzero fill factor among the given
    /// layers, or `None` when no page qualifies.
    pub async fn get_least_recently_used_page(
        &self,
        layers: &[String],
    ) -> Result<Option<TilePage>, StoreError> {
        self.issue_sync(|reply| Command::GetLeastRecentlyUsedPage {
            layers: layers.to_vec(),
            reply,
        })
        .await
    }

    /// Least frequently used page with a nonzero fill factor among the
    /// given layers, or `None` when no page qualifies.
    pub async fn get_least_frequently_used_page(
        &self,
        layers: &[String],
    ) -> Result<Option<TilePage>, StoreError> {
        self.issue_sync(|reply| Command::GetLeastFrequentlyUsedPage {
            layers: layers.to_vec(),
            reply,
        })
        .await
    }

    /// All known tile sets, excluding the internal global aggregate row.
    pub async fn tile_sets(&self) -> Result<Vec<TileSet>, StoreError> {
        self.issue_sync(|reply| Command::TileSets { reply }).await
    }

    /// Inclusive tile rectangle covered by a page, for truncation in the
    /// tile store.
    pub async fn get_tiles_for_page(&self, page: &TilePage) -> Result<TileRange, StoreError> {
        let tile_set = self.get_tile_set_by_id(page.tile_set_id()).await?;
        Ok(self.calculator.tile_range_for_page(&tile_set, page)?)
    }

    fn issue(&self, command: Command) -> Result<(), StoreError> {
        self.tx.send(command).map_err(|_| StoreError::Closed)
    }

    async fn issue_sync<R>(
        &self,
        make: impl FnOnce(oneshot::Sender<R>) -> Command,
    ) -> Result<R, StoreError> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(make(reply)).map_err(|_| StoreError::Closed)?;
        rx.await.map_err(|_| StoreError::Interrupted)
    }
}

/// The single writer: applies commands in submission order against the
/// tables. Replies are best-effort; a caller that stopped waiting does not
/// abort the command.
async fn run_writer(
    mut rx: mpsc::UnboundedReceiver<Command>,
    mut tables: StoreTables,
    calculator: Arc<TilePageCalculator>,
) {
    while let Some(command) = rx.recv().await {
        match command {
            Command::CreateLayer { layer, reply } => {
                for tile_set in calculator.tile_sets_for(&layer) {
                    if tables.create_tile_set(tile_set.clone()) {
                        debug!(tile_set = %tile_set.key(), "created tile set");
                    }
                }
                let _ = reply.send(());
            }
            Command::DeleteLayer { layer } => {
                let removed = tables.delete_tile_sets_where(|ts| ts.layer_name() == layer);
                info!(layer = %layer, freed = %removed.to_nice_string(), "deleted layer");
            }
            Command::DeleteGridSubset {
                layer,
                gridset_id,
                reply,
            } => {
                let removed = tables.delete_tile_sets_where(|ts| {
                    ts.layer_name() == layer && ts.gridset_id() == gridset_id
                });
                info!(
                    layer = %layer,
                    gridset = %gridset_id,
                    freed = %removed.to_nice_string(),
                    "deleted grid subset"
                );
                let _ = reply.send(());
            }
            Command::DeleteParameters {
                layer,
                parameters_id,
                reply,
            } => {
                let removed = tables.delete_tile_sets_where(|ts| {
                    ts.layer_name() == layer && ts.parameters_id() == Some(parameters_id.as_str())
                });
                info!(
                    layer = %layer,
                    parameters_id = %parameters_id,
                    freed = %removed.to_nice_string(),
                    "deleted parameter tile sets"
                );
                let _ = reply.send(());
            }
            Command::RenameLayer {
                old_layer,
                new_layer,
                reply,
            } => {
                tables.rename_layer(&old_layer, &new_layer);
                info!(from = %old_layer, to = %new_layer, "renamed layer");
                let _ = reply.send(());
            }
            Command::AddToQuotaAndTileCounts {
                tile_set,
                delta_bytes,
                payloads,
            } => {
                // Resolve every page's capacity before touching the tables
                // so a bad payload aborts the whole transaction.
                match resolve_payloads(&calculator, &tile_set, payloads) {
                    Ok(resolved) => {
                        tables.add_to_quota_and_tile_counts(&tile_set, delta_bytes, resolved);
                    }
                    Err(err) => {
                        warn!(
                            tile_set = %tile_set.key(),
                            error = %err,
                            "dropping accounting update for unaddressable page"
                        );
                    }
                }
            }
            Command::AddHitsAndSetAccessTime { payloads, reply } => {
                let snapshots = tables.add_hits_and_set_access_time(payloads);
                let _ = reply.send(snapshots);
            }
            Command::SetTruncated { page_key, reply } => {
                tables.set_truncated(&page_key);
                let _ = reply.send(());
            }
            Command::GetTileSetById { id, reply } => {
                let result = tables.tile_set_by_id(&id).map(|r| r.tile_set.clone());
                let _ = reply.send(result);
            }
            Command::GetUsedQuotaByTileSetId { id, reply } => {
                let _ = reply.send(tables.used_quota_by_tile_set_id(&id));
            }
            Command::GetUsedQuotaByLayerName { layer, reply } => {
                let _ = reply.send(tables.used_quota_by_layer(&layer));
            }
            Command::GetGloballyUsedQuota { reply } => {
                let _ = reply.send(tables.globally_used_quota());
            }
            Command::GetLeastRecentlyUsedPage { layers, reply } => {
                let set: HashSet<&str> = layers.iter().map(String::as_str).collect();
                let _ = reply.send(tables.least_recently_used_page(&set));
            }
            Command::GetLeastFrequentlyUsedPage { layers, reply } => {
                let set: HashSet<&str> = layers.iter().map(String::as_str).collect();
                let _ = reply.send(tables.least_frequently_used_page(&set));
            }
            Command::TileSets { reply } => {
                let _ = reply.send(tables.tile_sets());
            }
            Command::Shutdown { reply } => {
                let _ = reply.send(());
                break;
            }
        }
    }
    debug!("quota store writer stopped");
}

fn resolve_payloads(
    calculator: &TilePageCalculator,
    tile_set: &TileSet,
    payloads: Vec<PageStatsPayload>,
) -> Result<Vec<ResolvedPayload>, PyramidError> {
    payloads
        .into_iter()
        .map(|payload| {
            let tiles_per_page =
                calculator.tiles_per_page(tile_set, payload.page().zoom_level())?;
            Ok(ResolvedPayload {
                payload,
                tiles_per_page,
            })
        })
        .collect()
}

/// Verify or initialize the `version.txt` marker in the store directory.
fn check_version_marker(store_directory: &Path) -> Result<(), ConfigError> {
    let io_err = |source| ConfigError::Io {
        path: store_directory.to_path_buf(),
        source,
    };

    std::fs::create_dir_all(store_directory).map_err(io_err)?;

    let marker = store_directory.join(VERSION_FILE);
    if marker.exists() {
        let found = std::fs::read_to_string(&marker).map_err(io_err)?;
        let found = found.trim();
        if found != STORE_VERSION {
            return Err(ConfigError::VersionMismatch {
                path: store_directory.to_path_buf(),
                found: found.to_string(),
                expected: STORE_VERSION.to_string(),
            });
        }
    } else {
        std::fs::write(&marker, STORE_VERSION).map_err(io_err)?;
        debug!(path = %marker.display(), version = STORE_VERSION, "initialized store directory");
    }
    Ok(())
}
