#![warn(missing_docs)]

//! tether cache subsystem
//!
//! Two cooperating layers keep remote filesystem round trips down: an in-memory
//! [`CacheTier`] with per-cache TTL and capacity bounds, and a disk-backed
//! [`PersistentFileCache`] that survives process restarts.

pub mod error;
pub mod persistent;
pub mod tier;
pub mod types;

pub use error::{CacheError, Result};
pub use persistent::{CachedFile, PersistentCacheConfig, PersistentCacheStats, PersistentFileCache};
pub use tier::{CacheEntry, CacheLimits, CacheStats, CacheTier, CacheTierConfig, TtlCache};
pub use types::{parent_path, DirEntry, FileStat, FileType, RemotePath};
