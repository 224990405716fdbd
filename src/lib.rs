//! TileQuota - Disk quota accounting and cache eviction for tiled maps
//!
//! This library tracks how much storage every group of cached map tiles (a
//! "tile set") consumes, organizes tiles into coarse-grained pages for
//! efficient usage tracking, and evicts pages under LRU or LFU policies when
//! a configured quota is exceeded.
//!
//! # High-Level Flow
//!
//! The tile store reports write/delete/hit events through a
//! [`monitor::QuotaEventProducer`]; a [`monitor::QuotaUpdatesMonitor`]
//! batches them into the transactional [`store::QuotaStore`]; a periodic
//! [`cleaner::CacheCleanerTask`] compares usage against the configured
//! quotas and truncates the least valuable pages through the embedding
//! application's [`cleaner::TileStoreTruncator`]:
//!
//! ```ignore
//! use std::sync::Arc;
//! use tilequota::cleaner::{CacheCleaner, CacheCleanerTask, NoRebuilds};
//! use tilequota::config::QuotaConfig;
//! use tilequota::monitor::{BackpressurePolicy, QuotaUpdatesMonitor};
//! use tilequota::pyramid::TilePageCalculator;
//! use tilequota::store::QuotaStore;
//! use tokio_util::sync::CancellationToken;
//!
//! let calculator = Arc::new(TilePageCalculator::new(grid_config));
//! let (store, writer) = QuotaStore::open(&store_dir, Arc::clone(&calculator))?;
//!
//! let cancel = CancellationToken::new();
//! let config = QuotaConfig::default();
//! let (producer, monitor) = QuotaUpdatesMonitor::new(
//!     store.clone(),
//!     Arc::clone(&calculator),
//!     config.queue_size(),
//!     BackpressurePolicy::default(),
//!     cancel.clone(),
//! );
//! tokio::spawn(monitor.run());
//!
//! let cleaner = Arc::new(CacheCleaner::new(store.clone(), truncator));
//! let task = CacheCleanerTask::new(store.clone(), cleaner, config, Arc::new(NoRebuilds), cancel.clone());
//! tokio::spawn(task.run());
//! ```

pub mod cleaner;
pub mod config;
pub mod logging;
pub mod monitor;
pub mod page;
pub mod pyramid;
pub mod quota;
pub mod store;
pub mod tileset;
pub mod time;

/// Version of the tilequota library.
///
/// Defined in `Cargo.toml` and injected at compile time.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
