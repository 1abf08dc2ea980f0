//! Disk-backed chunk cache (§4.4).
//!
//! Entries are keyed by a `blake3` digest of `(url, offset, size)` so lookups
//! by digest make collisions practically impossible; writes land via
//! temp-file-then-rename so partial writes are never visible to readers.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;

use crate::config::{global_config, global_config_mut};

/// A strong content key for a `(url, offset, size)` triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey(blake3::Hash);

impl CacheKey {
    /// Derive the key for a given range.
    #[must_use]
    pub fn new(url: &str, offset: u64, size: u64) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(url.as_bytes());
        hasher.update(&offset.to_le_bytes());
        hasher.update(&size.to_le_bytes());
        Self(hasher.finalize())
    }

    fn file_name(&self) -> String {
        self.0.to_hex().to_string()
    }
}

/// A disk-backed cache of fetched chunk bytes, with an optional in-memory
/// LRU of recently-used keys on top (bounded by
/// [`crate::config::Config::disk_cache_capacity_bytes`]).
pub struct DiskChunkCache {
    dir: PathBuf,
    recent: Option<Arc<Mutex<LruCache<CacheKey, u64>>>>,
}

impl DiskChunkCache {
    /// Open (creating if needed) a cache rooted at `dir`.
    ///
    /// # Errors
    /// Returns an I/O error if `dir` cannot be created.
    pub fn open(dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let recent = global_config().disk_cache_capacity_bytes.map(|_| {
            // The capacity bound governs total bytes on disk; the in-memory
            // LRU only needs to remember eviction order, so it is sized
            // generously and pruned against the byte budget on each store.
            Arc::new(Mutex::new(LruCache::unbounded()))
        });
        Ok(Self { dir, recent })
    }

    fn path_for(&self, key: CacheKey) -> PathBuf {
        self.dir.join(key.file_name())
    }

    /// Look up `(url, offset, size)`; returns `None` on a cache miss (§4.4).
    ///
    /// # Errors
    /// Returns an I/O error if the entry exists but cannot be read.
    pub fn lookup(&self, url: &str, offset: u64, size: u64) -> std::io::Result<Option<Vec<u8>>> {
        let key = CacheKey::new(url, offset, size);
        let path = self.path_for(key);
        match std::fs::read(&path) {
            Ok(bytes) => {
                if let Some(recent) = &self.recent {
                    recent.lock().put(key, bytes.len() as u64);
                }
                Ok(Some(bytes))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Store `bytes` for `(url, offset, size)`, atomically via a temp file
    /// then rename so concurrent readers never observe a partial write.
    ///
    /// # Errors
    /// Returns an I/O error if the write or rename fails.
    pub fn store(&self, url: &str, offset: u64, size: u64, bytes: &[u8]) -> std::io::Result<()> {
        use std::io::Write;
        let key = CacheKey::new(url, offset, size);
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(bytes)?;
        tmp.flush()?;
        tmp.persist(self.path_for(key))
            .map_err(|e| e.error)?;
        if let Some(recent) = &self.recent {
            let mut recent = recent.lock();
            recent.put(key, bytes.len() as u64);
            self.evict_if_over_budget(&mut recent);
        }
        Ok(())
    }

    fn evict_if_over_budget(&self, recent: &mut LruCache<CacheKey, u64>) {
        let Some(budget) = global_config().disk_cache_capacity_bytes else {
            return;
        };
        let mut total: u64 = recent.iter().map(|(_, size)| *size).sum();
        while total > budget {
            let Some((key, size)) = recent.pop_lru() else {
                break;
            };
            total = total.saturating_sub(size);
            let path = self.path_for(key);
            if let Err(err) = std::fs::remove_file(&path) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    log::warn!("failed to evict cache entry {}: {err}", path.display());
                }
            }
        }
    }

    /// The directory this cache is rooted at.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_after_store() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskChunkCache::open(dir.path()).unwrap();
        assert!(cache.lookup("u", 0, 3).unwrap().is_none());
        cache.store("u", 0, 3, &[1, 2, 3]).unwrap();
        assert_eq!(cache.lookup("u", 0, 3).unwrap(), Some(vec![1, 2, 3]));
    }

    #[test]
    fn distinct_ranges_do_not_collide() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskChunkCache::open(dir.path()).unwrap();
        cache.store("u", 0, 3, &[1, 2, 3]).unwrap();
        cache.store("u", 3, 3, &[4, 5, 6]).unwrap();
        assert_eq!(cache.lookup("u", 0, 3).unwrap(), Some(vec![1, 2, 3]));
        assert_eq!(cache.lookup("u", 3, 3).unwrap(), Some(vec![4, 5, 6]));
    }

    #[test]
    fn eviction_respects_capacity_budget() {
        let dir = tempfile::tempdir().unwrap();
        global_config_mut().disk_cache_capacity_bytes = Some(4);
        let cache = DiskChunkCache::open(dir.path()).unwrap();
        cache.store("u", 0, 3, &[1, 2, 3]).unwrap();
        cache.store("u", 3, 3, &[4, 5, 6]).unwrap();
        // Oldest entry ("u",0,3) should have been evicted once the budget of
        // 4 bytes was exceeded by storing a second 3-byte entry.
        assert!(cache.lookup("u", 0, 3).unwrap().is_none());
        assert_eq!(cache.lookup("u", 3, 3).unwrap(), Some(vec![4, 5, 6]));
        global_config_mut().disk_cache_capacity_bytes = None;
    }
}
