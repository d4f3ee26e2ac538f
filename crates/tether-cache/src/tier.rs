//! In-memory cache tier: independent stat, directory-listing and content caches.
//!
//! Entries are valid while `now - inserted_at < max_age` and are purged lazily on
//! the next lookup. When a cache is full, the oldest batch of entries (a
//! configurable fraction, at least one) is evicted before the insert.

use crate::types::{DirEntry, FileStat, RemotePath};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheLimits {
    pub enabled: bool,
    pub max_age_ms: u64,
    pub max_entries: usize,
}

impl Default for CacheLimits {
    fn default() -> Self {
        Self {
            enabled: true,
            max_age_ms: 30_000,
            max_entries: 1000,
        }
    }
}

impl CacheLimits {
    pub fn max_age(&self) -> Duration {
        Duration::from_millis(self.max_age_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheTierConfig {
    pub stat: CacheLimits,
    pub directory: CacheLimits,
    pub content: CacheLimits,
    /// Content larger than this many bytes is never cached.
    pub max_content_size: usize,
    /// Share of a full cache dropped per eviction pass.
    pub eviction_fraction: f64,
}

impl Default for CacheTierConfig {
    fn default() -> Self {
        Self {
            stat: CacheLimits::default(),
            directory: CacheLimits::default(),
            content: CacheLimits::default(),
            max_content_size: 1024 * 1024,
            eviction_fraction: 0.1,
        }
    }
}

pub struct CacheEntry<V> {
    pub value: V,
    pub inserted_at: Instant,
}

impl<V> CacheEntry<V> {
    fn is_valid(&self, max_age: Duration) -> bool {
        self.inserted_at.elapsed() < max_age
    }
}

/// A single TTL cache keyed by `connection_id:path`.
pub struct TtlCache<V> {
    entries: HashMap<String, CacheEntry<V>>,
    limits: CacheLimits,
    eviction_fraction: f64,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl<V: Clone> TtlCache<V> {
    pub fn new(limits: CacheLimits, eviction_fraction: f64) -> Self {
        Self {
            entries: HashMap::new(),
            limits,
            eviction_fraction,
            hits: 0,
            misses: 0,
            evictions: 0,
        }
    }

    pub fn get(&mut self, key: &str) -> Option<V> {
        if !self.limits.enabled {
            return None;
        }
        let max_age = self.limits.max_age();
        match self.entries.get(key).map(|entry| entry.is_valid(max_age)) {
            Some(true) => {
                self.hits += 1;
                self.entries.get(key).map(|entry| entry.value.clone())
            }
            Some(false) => {
                self.entries.remove(key);
                self.misses += 1;
                None
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    pub fn insert(&mut self, key: String, value: V) {
        if !self.limits.enabled || self.limits.max_entries == 0 {
            return;
        }
        if !self.entries.contains_key(&key) {
            self.make_room();
        }
        self.entries.insert(
            key,
            CacheEntry {
                value,
                inserted_at: Instant::now(),
            },
        );
    }

    /// Evicts the oldest batch when the cache is at capacity. Returns the number removed.
    fn make_room(&mut self) -> usize {
        let len = self.entries.len();
        if len < self.limits.max_entries {
            return 0;
        }

        let mut by_age: Vec<(String, Instant)> = self
            .entries
            .iter()
            .map(|(key, entry)| (key.clone(), entry.inserted_at))
            .collect();
        by_age.sort_by_key(|(_, inserted_at)| *inserted_at);

        let fraction = (len as f64 * self.eviction_fraction) as usize;
        let needed = len + 1 - self.limits.max_entries;
        let batch = fraction.max(needed).max(1);

        for (key, _) in by_age.into_iter().take(batch) {
            self.entries.remove(&key);
            self.evictions += 1;
        }
        tracing::debug!("evicted {} cache entries ({} before eviction)", batch, len);
        batch
    }

    pub fn remove(&mut self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn remove_prefix(&mut self, prefix: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|key, _| !key.starts_with(prefix));
        before - self.entries.len()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }

    pub fn evictions(&self) -> u64 {
        self.evictions
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.hits = 0;
        self.misses = 0;
        self.evictions = 0;
    }
}

/// Read-only snapshot of cache tier counters.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct CacheStats {
    pub stat_hits: u64,
    pub stat_misses: u64,
    pub directory_hits: u64,
    pub directory_misses: u64,
    pub content_hits: u64,
    pub content_misses: u64,
    pub evictions: u64,
    pub stat_entries: usize,
    pub directory_entries: usize,
    pub content_entries: usize,
}

fn hit_rate(hits: u64, misses: u64) -> f64 {
    let total = hits + misses;
    if total == 0 {
        0.0
    } else {
        hits as f64 / total as f64
    }
}

impl CacheStats {
    pub fn stat_hit_rate(&self) -> f64 {
        hit_rate(self.stat_hits, self.stat_misses)
    }

    pub fn directory_hit_rate(&self) -> f64 {
        hit_rate(self.directory_hits, self.directory_misses)
    }

    pub fn content_hit_rate(&self) -> f64 {
        hit_rate(self.content_hits, self.content_misses)
    }

    pub fn overall_hit_rate(&self) -> f64 {
        hit_rate(
            self.stat_hits + self.directory_hits + self.content_hits,
            self.stat_misses + self.directory_misses + self.content_misses,
        )
    }
}

pub struct CacheTier {
    stats: TtlCache<FileStat>,
    directories: TtlCache<Vec<DirEntry>>,
    contents: TtlCache<Vec<u8>>,
    max_content_size: usize,
}

impl CacheTier {
    pub fn new(config: CacheTierConfig) -> Self {
        tracing::debug!(
            "cache tier: stat={}x{}ms dir={}x{}ms content={}x{}ms max_content={}B",
            config.stat.max_entries,
            config.stat.max_age_ms,
            config.directory.max_entries,
            config.directory.max_age_ms,
            config.content.max_entries,
            config.content.max_age_ms,
            config.max_content_size
        );
        Self {
            stats: TtlCache::new(config.stat, config.eviction_fraction),
            directories: TtlCache::new(config.directory, config.eviction_fraction),
            contents: TtlCache::new(config.content, config.eviction_fraction),
            max_content_size: config.max_content_size,
        }
    }

    pub fn get_stat(&mut self, path: &RemotePath) -> Option<FileStat> {
        self.stats.get(&path.cache_key())
    }

    pub fn set_stat(&mut self, path: &RemotePath, stat: FileStat) {
        self.stats.insert(path.cache_key(), stat);
    }

    pub fn get_directory(&mut self, path: &RemotePath) -> Option<Vec<DirEntry>> {
        self.directories.get(&path.cache_key())
    }

    pub fn set_directory(&mut self, path: &RemotePath, entries: Vec<DirEntry>) {
        self.directories.insert(path.cache_key(), entries);
    }

    pub fn get_content(&mut self, path: &RemotePath) -> Option<Vec<u8>> {
        self.contents.get(&path.cache_key())
    }

    /// Caches file content. Returns `false` when the content is too large to cache.
    pub fn set_content(&mut self, path: &RemotePath, content: Vec<u8>) -> bool {
        if content.len() > self.max_content_size {
            tracing::debug!(
                "not caching {} bytes for {} (limit {})",
                content.len(),
                path,
                self.max_content_size
            );
            return false;
        }
        self.contents.insert(path.cache_key(), content);
        true
    }

    /// Drops every entry for `path` plus the listing of its parent directory.
    pub fn invalidate(&mut self, path: &RemotePath) {
        let key = path.cache_key();
        self.stats.remove(&key);
        self.directories.remove(&key);
        self.contents.remove(&key);
        self.directories.remove(&path.parent().cache_key());
    }

    pub fn invalidate_connection(&mut self, connection_id: &str) -> usize {
        let prefix = format!("{}:", connection_id);
        let removed = self.stats.remove_prefix(&prefix)
            + self.directories.remove_prefix(&prefix)
            + self.contents.remove_prefix(&prefix);
        if removed > 0 {
            tracing::debug!(
                "invalidated {} cache entries for connection {}",
                removed,
                connection_id
            );
        }
        removed
    }

    pub fn clear(&mut self) {
        self.stats.clear();
        self.directories.clear();
        self.contents.clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            stat_hits: self.stats.hits(),
            stat_misses: self.stats.misses(),
            directory_hits: self.directories.hits(),
            directory_misses: self.directories.misses(),
            content_hits: self.contents.hits(),
            content_misses: self.contents.misses(),
            evictions: self.stats.evictions()
                + self.directories.evictions()
                + self.contents.evictions(),
            stat_entries: self.stats.len(),
            directory_entries: self.directories.len(),
            content_entries: self.contents.len(),
        }
    }
}

impl Default for CacheTier {
    fn default() -> Self {
        Self::new(CacheTierConfig::default())
    }
}
