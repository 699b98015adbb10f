//! Persistent cache storage for SQM photometer datasets.
//!
//! This crate provides the storage layer behind the synchronization engine:
//!
//! - [`CacheRoot`] / [`Cache`]: a directory of JSON blobs guarded by an
//!   exclusive advisory lock, so that one process writes and the rest read
//! - [`SnapshotStore`]: the readings last seen in each source file
//! - [`PartitionStore`]: readings grouped by night with attributes
//! - [`RollupStore`]: the best reading of each night
//!
//! Every store has an in-memory variant, used when caching is disabled, and a
//! variant backed by a [`Cache`].
//!
//! # Example
//!
//! ```no_run
//! use sqm_store::{CacheRoot, DiskPartitions, PartitionStore};
//!
//! let root = CacheRoot::initialize(sqm_store::default_cache_path(), false, false);
//! let partitions = DiskPartitions::new(root.create("station_all"));
//! println!("{} nights cached", partitions.dates().len());
//! ```

pub mod cache;
mod error;
pub mod dataset;
pub mod rollup;
pub mod snapshot;

pub use cache::{Cache, CacheRoot, LOCK_FILE_NAME};
pub use dataset::{DiskPartitions, MemoryPartitions, Partition, PartitionStore};
pub use error::{Error, Result};
pub use rollup::{DiskRollups, MemoryRollups, RollupStore};
pub use snapshot::{DiskSnapshots, MemorySnapshots, SnapshotStore};

/// Default cache root following platform conventions.
///
/// - Linux: `~/.cache/sqm`
/// - macOS: `~/Library/Caches/sqm`
/// - Windows: `C:\Users\<user>\AppData\Local\sqm`
pub fn default_cache_path() -> std::path::PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join("sqm")
}

/// Cache id holding a station's night partitions.
pub fn partitions_cache_id(station: &str) -> String {
    format!("{station}_all")
}

/// Cache id holding a station's best-of-night records.
pub fn rollups_cache_id(station: &str) -> String {
    format!("{station}_best")
}

/// Cache id holding a station's per-file snapshots.
pub fn snapshots_cache_id(station: &str) -> String {
    format!("{station}_readings")
}
