//! Disk-backed file cache that survives process restarts.
//!
//! Every cached file is one artifact `<blake3(key)>.entry` in the cache
//! directory, holding a bincode record with the key, the index metadata and the
//! (optionally lz4-compressed) content. Only metadata stays in memory; content is
//! read back from disk on lookup.

use crate::error::{CacheError, Result};
use crate::types::FileStat;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

const ARTIFACT_EXTENSION: &str = "entry";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistentCacheConfig {
    pub cache_dir: PathBuf,
    /// Total budget for cached content, in bytes.
    pub max_size: u64,
    pub max_age_ms: u64,
    pub compression: bool,
    /// How stale an artifact's recorded access time may get before a read
    /// writes the new one back, so eviction order survives restarts.
    pub access_flush_ms: u64,
}

impl Default for PersistentCacheConfig {
    fn default() -> Self {
        Self {
            cache_dir: std::env::temp_dir().join("tether-cache"),
            max_size: 100 * 1024 * 1024,
            max_age_ms: 30 * 60 * 1000,
            compression: true,
            access_flush_ms: 60 * 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct IndexEntry {
    path: String,
    metadata: FileStat,
    size: u64,
    compressed: bool,
    last_accessed_ms: u64,
    last_modified_ms: u64,
}

#[derive(Serialize, Deserialize)]
struct DiskRecord {
    key: String,
    entry: IndexEntry,
    content: Vec<u8>,
}

/// A cached file as returned by [`PersistentFileCache::get_file`].
#[derive(Debug, Clone, PartialEq)]
pub struct CachedFile {
    pub path: String,
    pub content: Vec<u8>,
    pub metadata: FileStat,
    pub size: u64,
    pub last_accessed_ms: u64,
    pub last_modified_ms: u64,
    pub is_directory: bool,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct PersistentCacheStats {
    pub total_files: usize,
    pub total_size: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

impl PersistentCacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    pub fn miss_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.misses as f64 / total as f64
        }
    }
}

enum Lookup {
    Fresh(IndexEntry),
    Expired,
    Missing,
}

#[derive(Default)]
struct Index {
    entries: HashMap<String, IndexEntry>,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl Index {
    fn total_size(&self) -> u64 {
        self.entries.values().map(|e| e.size).sum()
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn cache_key(connection_id: &str, path: &str) -> String {
    format!("{}:{}", connection_id, path)
}

pub struct PersistentFileCache {
    config: PersistentCacheConfig,
    index: Mutex<Index>,
}

impl PersistentFileCache {
    /// Creates the cache directory if needed. Call [`load_from_disk`](Self::load_from_disk)
    /// to pick up artifacts from a previous run.
    pub async fn open(config: PersistentCacheConfig) -> Result<Self> {
        tokio::fs::create_dir_all(&config.cache_dir).await?;
        tracing::debug!(
            "persistent cache at {} (max {} bytes, max age {}ms)",
            config.cache_dir.display(),
            config.max_size,
            config.max_age_ms
        );
        Ok(Self {
            config,
            index: Mutex::new(Index::default()),
        })
    }

    pub fn config(&self) -> &PersistentCacheConfig {
        &self.config
    }

    fn artifact_path(&self, key: &str) -> PathBuf {
        let digest = blake3::hash(key.as_bytes());
        self.config
            .cache_dir
            .join(format!("{}.{}", digest.to_hex(), ARTIFACT_EXTENSION))
    }

    /// Rebuilds the index from artifacts on disk. Corrupted artifacts are logged,
    /// removed and skipped. Returns the number of entries loaded.
    pub async fn load_from_disk(&self) -> Result<usize> {
        let mut dir = tokio::fs::read_dir(&self.config.cache_dir).await?;
        let mut loaded = Vec::new();

        while let Some(item) = dir.next_entry().await? {
            let path = item.path();
            if path.extension().and_then(|e| e.to_str()) != Some(ARTIFACT_EXTENSION) {
                continue;
            }
            match read_record(&path).await {
                Ok(record) => loaded.push((record.key, record.entry)),
                Err(e) => {
                    tracing::warn!("dropping unreadable cache artifact: {}", e);
                    if let Err(e) = tokio::fs::remove_file(&path).await {
                        tracing::debug!("failed to remove {}: {}", path.display(), e);
                    }
                }
            }
        }

        let count = loaded.len();
        let mut index = self.index.lock();
        for (key, entry) in loaded {
            index.entries.insert(key, entry);
        }
        tracing::info!("loaded {} persistent cache entries", count);
        Ok(count)
    }

    pub async fn get_file(&self, connection_id: &str, path: &str) -> Result<Option<CachedFile>> {
        let key = cache_key(connection_id, path);
        let now = now_ms();

        let lookup = {
            let mut index = self.index.lock();
            let state = index
                .entries
                .get(&key)
                .map(|e| now.saturating_sub(e.last_modified_ms) < self.config.max_age_ms);
            match state {
                Some(true) => {
                    index.hits += 1;
                    match index.entries.get_mut(&key) {
                        Some(entry) => {
                            entry.last_accessed_ms = now;
                            Lookup::Fresh(entry.clone())
                        }
                        None => Lookup::Missing,
                    }
                }
                Some(false) => {
                    index.entries.remove(&key);
                    index.evictions += 1;
                    index.misses += 1;
                    Lookup::Expired
                }
                None => {
                    index.misses += 1;
                    Lookup::Missing
                }
            }
        };

        let artifact = self.artifact_path(&key);
        let entry = match lookup {
            Lookup::Fresh(entry) => entry,
            Lookup::Expired => {
                tracing::debug!("persistent cache entry {} expired", key);
                remove_artifact(&artifact).await;
                return Ok(None);
            }
            Lookup::Missing => return Ok(None),
        };

        let record = match read_record(&artifact).await {
            Ok(record) if record.key == key => record,
            Ok(record) => {
                // Another key owns this artifact; leave it on disk.
                tracing::warn!("cache artifact for {} holds {}", key, record.key);
                self.forget(&key);
                return Ok(None);
            }
            Err(e) => {
                tracing::warn!("cache artifact for {} is missing or unreadable: {}", key, e);
                self.forget(&key);
                remove_artifact(&artifact).await;
                return Ok(None);
            }
        };

        let decoded = if entry.compressed {
            match lz4_flex::decompress_size_prepended(&record.content) {
                Ok(content) => Some(content),
                Err(e) => {
                    let err = CacheError::Decompress {
                        key: key.clone(),
                        reason: e.to_string(),
                    };
                    tracing::warn!("dropping corrupted cache artifact: {}", err);
                    self.forget(&key);
                    remove_artifact(&artifact).await;
                    return Ok(None);
                }
            }
        } else {
            None
        };

        if now.saturating_sub(record.entry.last_accessed_ms) >= self.config.access_flush_ms {
            self.flush_access_time(&key, &artifact, &entry, &record).await;
        }
        let content = decoded.unwrap_or(record.content);

        Ok(Some(CachedFile {
            path: entry.path,
            content,
            is_directory: entry.metadata.is_dir(),
            metadata: entry.metadata,
            size: entry.size,
            last_accessed_ms: entry.last_accessed_ms,
            last_modified_ms: entry.last_modified_ms,
        }))
    }

    async fn flush_access_time(
        &self,
        key: &str,
        artifact: &Path,
        entry: &IndexEntry,
        record: &DiskRecord,
    ) {
        let current = self
            .index
            .lock()
            .entries
            .get(key)
            .map_or(false, |e| e.last_modified_ms == record.entry.last_modified_ms);
        if !current {
            return;
        }
        let updated = DiskRecord {
            key: record.key.clone(),
            entry: entry.clone(),
            content: record.content.clone(),
        };
        match bincode::serialize(&updated) {
            Ok(bytes) => {
                if let Err(e) = tokio::fs::write(artifact, bytes).await {
                    tracing::debug!("failed to record access time for {}: {}", key, e);
                }
            }
            Err(e) => tracing::debug!("failed to encode access time for {}: {}", key, e),
        }
    }

    /// Forgets an entry whose artifact could not be used, turning the hit
    /// already counted for it into a miss.
    fn forget(&self, key: &str) {
        let mut index = self.index.lock();
        index.entries.remove(key);
        index.hits = index.hits.saturating_sub(1);
        index.misses += 1;
    }

    /// Stores a file, evicting least-recently-accessed entries until it fits.
    /// Returns `false` when the file alone exceeds the cache budget.
    pub async fn set_file(
        &self,
        connection_id: &str,
        path: &str,
        content: &[u8],
        metadata: FileStat,
    ) -> Result<bool> {
        let key = cache_key(connection_id, path);
        let size = content.len() as u64;
        if size > self.config.max_size {
            tracing::debug!(
                "{} is {} bytes, larger than the persistent cache budget",
                key,
                size
            );
            return Ok(false);
        }

        let now = now_ms();
        let entry = IndexEntry {
            path: path.to_string(),
            metadata,
            size,
            compressed: self.config.compression,
            last_accessed_ms: now,
            last_modified_ms: now,
        };
        let stored = if self.config.compression {
            lz4_flex::compress_prepend_size(content)
        } else {
            content.to_vec()
        };
        let bytes = bincode::serialize(&DiskRecord {
            key: key.clone(),
            entry: entry.clone(),
            content: stored,
        })
        .map_err(|e| CacheError::Encode {
            key: key.clone(),
            reason: e.to_string(),
        })?;

        let victims = {
            let mut index = self.index.lock();
            index.entries.remove(&key);
            let victims = evict_until_fits(&mut index, size, self.config.max_size);
            index.entries.insert(key.clone(), entry);
            victims
        };

        for victim in &victims {
            remove_artifact(&self.artifact_path(victim)).await;
        }

        let artifact = self.artifact_path(&key);
        if let Err(e) = tokio::fs::write(&artifact, bytes).await {
            self.index.lock().entries.remove(&key);
            return Err(e.into());
        }
        Ok(true)
    }

    pub async fn invalidate_file(&self, connection_id: &str, path: &str) -> Result<bool> {
        let key = cache_key(connection_id, path);
        let removed = self.index.lock().entries.remove(&key).is_some();
        remove_artifact(&self.artifact_path(&key)).await;
        Ok(removed)
    }

    /// Removes `dir` and every cached path below it.
    pub async fn invalidate_directory(&self, connection_id: &str, dir: &str) -> Result<usize> {
        let exact = cache_key(connection_id, dir.trim_end_matches('/'));
        let prefix = format!("{}/", exact);
        let root = cache_key(connection_id, dir);

        let keys: Vec<String> = {
            let mut index = self.index.lock();
            let keys: Vec<String> = index
                .entries
                .keys()
                .filter(|k| **k == exact || **k == root || k.starts_with(&prefix))
                .cloned()
                .collect();
            for key in &keys {
                index.entries.remove(key);
            }
            keys
        };

        for key in &keys {
            remove_artifact(&self.artifact_path(key)).await;
        }
        if !keys.is_empty() {
            tracing::debug!("invalidated {} persistent entries under {}", keys.len(), root);
        }
        Ok(keys.len())
    }

    pub async fn clear(&self) -> Result<()> {
        {
            let mut index = self.index.lock();
            *index = Index::default();
        }
        let mut dir = tokio::fs::read_dir(&self.config.cache_dir).await?;
        while let Some(item) = dir.next_entry().await? {
            let path = item.path();
            if path.extension().and_then(|e| e.to_str()) == Some(ARTIFACT_EXTENSION) {
                tokio::fs::remove_file(&path).await?;
            }
        }
        Ok(())
    }

    pub fn stats(&self) -> PersistentCacheStats {
        let index = self.index.lock();
        PersistentCacheStats {
            total_files: index.entries.len(),
            total_size: index.total_size(),
            hits: index.hits,
            misses: index.misses,
            evictions: index.evictions,
        }
    }

    pub fn contains(&self, connection_id: &str, path: &str) -> bool {
        self.index
            .lock()
            .entries
            .contains_key(&cache_key(connection_id, path))
    }
}

fn evict_until_fits(index: &mut Index, incoming: u64, budget: u64) -> Vec<String> {
    let mut total = index.total_size();
    if total + incoming <= budget {
        return Vec::new();
    }

    let mut by_access: Vec<(String, u64, u64)> = index
        .entries
        .iter()
        .map(|(k, e)| (k.clone(), e.last_accessed_ms, e.size))
        .collect();
    by_access.sort_by_key(|(_, accessed, _)| *accessed);

    let mut victims = Vec::new();
    for (key, _, size) in by_access {
        if total + incoming <= budget {
            break;
        }
        index.entries.remove(&key);
        index.evictions += 1;
        total = total.saturating_sub(size);
        victims.push(key);
    }
    victims
}

async fn read_record(path: &Path) -> Result<DiskRecord> {
    let bytes = tokio::fs::read(path).await?;
    bincode::deserialize(&bytes).map_err(|e| CacheError::Corrupted {
        path: path.display().to_string(),
        reason: e.to_string(),
    })
}

async fn remove_artifact(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!("failed to remove cache artifact {}: {}", path.display(), e),
    }
}
