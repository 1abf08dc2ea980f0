//! The reference store (§4.1): a Zarr-compatible key/value store over a mix
//! of inline bytes and external `(url, offset, size)` references.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

pub use crate::error::StoreError;
use crate::cache::DiskChunkCache;
use crate::fetch::{fetch_with_retry, CancellationToken, DefaultRangeFetcher, RangeFetcher};
use crate::key::{StoreKey, StorePrefix};
use crate::rfs::{Ref, Rfs};
use crate::staging::StagingArea;
use crate::tar::{RangeRead, TarIndex};

/// Children immediately under a prefix (§4.1 `list_dir`), matching the
/// conventional Zarr `keys` / `prefixes` split.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListDirResult {
    /// Keys directly under the prefix (no further `/`).
    pub keys: Vec<String>,
    /// Sub-prefixes directly under the prefix.
    pub prefixes: Vec<String>,
}

/// How self-referential refs (§3, §4.6) are resolved to bytes.
pub enum Backing {
    /// `.lindi.json` alone: every external ref must be a genuine remote URL.
    Json,
    /// `.lindi.tar`: self-references are absolute byte offsets into the
    /// archive, validated against the tar member table (§4.6).
    Tar {
        /// Source of archive bytes (local file or remote URL).
        source: Arc<dyn RangeRead>,
        /// The member table read at open time.
        index: TarIndex,
    },
    /// `.lindi.d`: self-references are offsets into a single `lindi.blob` file.
    Dir {
        /// Path to the directory's blob file.
        blob_path: PathBuf,
    },
}

struct Inner {
    rfs: Rfs,
    staging: Option<StagingArea>,
}

/// A reference store: reads are fully parallel; writes are serialized by a
/// single-writer lock, matching §5's concurrency model.
pub struct ReferenceStore {
    inner: RwLock<Inner>,
    writer_lock: Mutex<()>,
    read_only: bool,
    backing: Backing,
    fetcher: Arc<dyn RangeFetcher>,
    cache: Option<Arc<DiskChunkCache>>,
    cancel: Option<CancellationToken>,
}

/// Bytes above this size written via [`ReferenceStore::set`] are staged as a
/// new external reference rather than inlined (§4.1, §4.5).
pub const INLINE_MAX_BYTES: usize = 512;

impl ReferenceStore {
    /// Build a store over an already-loaded (or freshly translated) [`Rfs`].
    #[must_use]
    pub fn new(rfs: Rfs, backing: Backing, read_only: bool, staging: Option<StagingArea>) -> Self {
        Self {
            inner: RwLock::new(Inner { rfs, staging }),
            writer_lock: Mutex::new(()),
            read_only,
            backing,
            fetcher: Arc::new(DefaultRangeFetcher::new()),
            cache: None,
            cancel: None,
        }
    }

    /// Attach a disk-backed chunk cache (§4.4).
    #[must_use]
    pub fn with_cache(mut self, cache: Arc<DiskChunkCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Override the range fetcher (e.g. in tests, with a mock).
    #[must_use]
    pub fn with_fetcher(mut self, fetcher: Arc<dyn RangeFetcher>) -> Self {
        self.fetcher = fetcher;
        self
    }

    /// Attach a cancellation token checked between fetch retries.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// `get(key) -> bytes | NotFound` (§4.1).
    ///
    /// # Errors
    /// Returns [`StoreError::NotFound`] if no ref exists for `key`, or
    /// [`StoreError::CorruptReference`] / [`StoreError::Fetch`] if resolving
    /// an external ref fails.
    pub fn get(&self, key: &StoreKey) -> Result<Vec<u8>, StoreError> {
        let r = {
            let inner = self.inner.read();
            inner
                .rfs
                .refs
                .get(key.as_str())
                .cloned()
                .ok_or_else(|| StoreError::NotFound(key.as_str().to_string()))?
        };
        self.resolve(key.as_str(), &r)
    }

    fn resolve(&self, key: &str, r: &Ref) -> Result<Vec<u8>, StoreError> {
        match r {
            Ref::Inline(s) => Ok(s.clone().into_bytes()),
            Ref::InlineBase64(b64) => {
                use base64::Engine;
                base64::engine::general_purpose::STANDARD
                    .decode(b64)
                    .map_err(|_| StoreError::CorruptReference {
                        key: key.to_string(),
                        declared: 0,
                        actual: 0,
                    })
            }
            Ref::External { url, offset, size } => {
                if r.is_self_referential() {
                    self.resolve_self_reference(*offset, *size)
                } else {
                    self.fetch_external(key, url, *offset, *size)
                }
            }
        }
    }

    fn resolve_self_reference(&self, offset: u64, size: u64) -> Result<Vec<u8>, StoreError> {
        match &self.backing {
            Backing::Json => Err(StoreError::Unsupported(
                "self-referential ref in a .lindi.json-only store".to_string(),
            )),
            Backing::Tar { source, index } => {
                let in_bounds = index
                    .members
                    .values()
                    .any(|m| offset >= m.data_offset && offset + size <= m.data_offset + m.data_size);
                if !in_bounds {
                    return Err(StoreError::SelfReferenceOutOfBounds(offset, size));
                }
                Ok(source.read_range(offset, size)?)
            }
            Backing::Dir { blob_path } => {
                use std::io::{Read, Seek, SeekFrom};
                let len = std::fs::metadata(blob_path)?.len();
                if offset + size > len {
                    return Err(StoreError::SelfReferenceOutOfBounds(offset, size));
                }
                let mut file = std::fs::File::open(blob_path)?;
                file.seek(SeekFrom::Start(offset))?;
                let mut buf = vec![0u8; usize::try_from(size).unwrap()];
                file.read_exact(&mut buf)?;
                Ok(buf)
            }
        }
    }

    fn fetch_external(&self, key: &str, url: &str, offset: u64, size: u64) -> Result<Vec<u8>, StoreError> {
        if let Some(cache) = &self.cache {
            if let Some(bytes) = cache.lookup(url, offset, size)? {
                return Ok(bytes);
            }
        }
        let bytes = fetch_with_retry(self.fetcher.as_ref(), url, offset, size, self.cancel.as_ref())?;
        if bytes.len() as u64 != size {
            return Err(StoreError::CorruptReference {
                key: key.to_string(),
                declared: size,
                actual: bytes.len() as u64,
            });
        }
        if let Some(cache) = &self.cache {
            cache.store(url, offset, size, &bytes)?;
        }
        Ok(bytes)
    }

    /// `set(key, bytes)` (§4.1, read-write only). Small values are inlined;
    /// larger values are delegated to the staging area (§4.5).
    ///
    /// # Errors
    /// Returns [`StoreError::ReadOnly`] if the store was opened read-only.
    pub fn set(&self, key: &StoreKey, bytes: &[u8]) -> Result<(), StoreError> {
        if self.read_only {
            return Err(StoreError::ReadOnly);
        }
        let _guard = self.writer_lock.lock();
        let mut inner = self.inner.write();

        let is_metadata = matches!(key.name(), ".zattrs" | ".zgroup" | ".zarray");
        let r = if is_metadata || bytes.len() <= INLINE_MAX_BYTES {
            if is_metadata {
                let text = String::from_utf8(bytes.to_vec()).map_err(|_| StoreError::CorruptReference {
                    key: key.as_str().to_string(),
                    declared: 0,
                    actual: 0,
                })?;
                Ref::Inline(text)
            } else {
                use base64::Engine;
                Ref::InlineBase64(base64::engine::general_purpose::STANDARD.encode(bytes))
            }
        } else {
            let staging = inner
                .staging
                .as_mut()
                .ok_or_else(|| StoreError::Unsupported("store has no staging area to write large chunks".to_string()))?;
            let path = staging.stage_chunk(bytes)?;
            Ref::External {
                url: format!("file://{}", path.display()),
                offset: 0,
                size: bytes.len() as u64,
            }
        };
        inner.rfs.refs.insert(key.as_str().to_string(), r);
        Ok(())
    }

    /// `list_dir(prefix) -> [keys]` (§4.1): immediate children only.
    #[must_use]
    pub fn list_dir(&self, prefix: &StorePrefix) -> ListDirResult {
        let inner = self.inner.read();
        let mut keys = BTreeSet::new();
        let mut prefixes = BTreeSet::new();
        for key in inner.rfs.refs.keys() {
            let Some(rest) = key.strip_prefix(prefix.as_str()) else {
                continue;
            };
            if rest.is_empty() {
                continue;
            }
            match rest.split_once('/') {
                None => {
                    keys.insert(key.clone());
                }
                Some((child, _)) => {
                    prefixes.insert(format!("{}{child}/", prefix.as_str()));
                }
            }
        }
        ListDirResult {
            keys: keys.into_iter().collect(),
            prefixes: prefixes.into_iter().collect(),
        }
    }

    /// `contains(key) -> bool` (§4.1).
    #[must_use]
    pub fn contains(&self, key: &StoreKey) -> bool {
        self.inner.read().rfs.refs.contains_key(key.as_str())
    }

    /// `delete(key)` (§4.1, read-write only).
    ///
    /// # Errors
    /// Returns [`StoreError::ReadOnly`] if the store was opened read-only.
    pub fn delete(&self, key: &StoreKey) -> Result<(), StoreError> {
        if self.read_only {
            return Err(StoreError::ReadOnly);
        }
        let _guard = self.writer_lock.lock();
        self.inner.write().rfs.refs.remove(key.as_str());
        Ok(())
    }

    /// `to_rfs() -> RFS` (§4.1): a snapshot of the current document.
    #[must_use]
    pub fn to_rfs(&self) -> Rfs {
        self.inner.read().rfs.clone()
    }

    /// True if this store was opened read-only.
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> StoreKey {
        StoreKey::new(s).unwrap()
    }

    #[test]
    fn get_inline_and_base64() {
        let mut rfs = Rfs::new();
        rfs.set_inline("g/.zattrs", r#"{"a":1}"#);
        rfs.set_inline_bytes("g/d/0", &[1, 2, 3, 4]);
        let store = ReferenceStore::new(rfs, Backing::Json, true, None);
        assert_eq!(store.get(&key("g/.zattrs")).unwrap(), br#"{"a":1}"#);
        assert_eq!(store.get(&key("g/d/0")).unwrap(), vec![1, 2, 3, 4]);
        assert!(store.get(&key("missing")).is_err());
    }

    #[test]
    fn list_dir_splits_keys_and_prefixes() {
        let mut rfs = Rfs::new();
        rfs.set_inline("a/b", "1");
        rfs.set_inline("a/c", "2");
        rfs.set_inline("a/d/e", "3");
        rfs.set_inline("i/j/k", "4");
        let store = ReferenceStore::new(rfs, Backing::Json, true, None);
        let result = store.list_dir(&StorePrefix::new("a/").unwrap());
        assert_eq!(result.keys, vec!["a/b".to_string(), "a/c".to_string()]);
        assert_eq!(result.prefixes, vec!["a/d/".to_string()]);
    }

    #[test]
    fn read_only_store_rejects_writes() {
        let store = ReferenceStore::new(Rfs::new(), Backing::Json, true, None);
        assert!(matches!(
            store.set(&key("a"), b"x").unwrap_err(),
            StoreError::ReadOnly
        ));
        assert!(matches!(
            store.delete(&key("a")).unwrap_err(),
            StoreError::ReadOnly
        ));
    }

    #[test]
    fn set_inlines_small_values_and_stages_large_ones() {
        let dir = tempfile::tempdir().unwrap();
        let staging = StagingArea::new(dir.path()).unwrap();
        let store = ReferenceStore::new(Rfs::new(), Backing::Json, false, Some(staging));
        store.set(&key("small"), &[1, 2, 3]).unwrap();
        let big = vec![7u8; INLINE_MAX_BYTES + 1];
        store.set(&key("big"), &big).unwrap();

        let rfs = store.to_rfs();
        assert!(matches!(rfs.refs.get("small"), Some(Ref::InlineBase64(_))));
        assert!(matches!(rfs.refs.get("big"), Some(Ref::External { .. })));
    }
}
