//! The random-access tar container (§4.2).
//!
//! A LINDI tar is an otherwise ordinary POSIX ustar archive with a
//! self-describing index: `.tar_entry.json` is always the first member,
//! exactly 1024 bytes; it points at `.tar_index.json`, which enumerates
//! every member's byte range and (for growable members) its whitespace-padded
//! capacity. Opening costs exactly two range reads. Growing a member
//! in-place rewrites its whitespace padding; overflowing a member's capacity
//! tombstones its header (renaming it under `./trash/` without moving data)
//! and appends a fresh, larger member at the archive's logical end.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

pub use crate::error::TarError;
use crate::fetch::{fetch_with_retry, CancellationToken, RangeFetcher};

const BLOCK_SIZE: u64 = 512;
const ENTRY_MEMBER_SIZE: u64 = 1024;
const ENTRY_NAME: &str = ".tar_entry.json";
const INDEX_NAME: &str = ".tar_index.json";
const TRASH_PREFIX: &str = "./trash/";

fn round_up_block(n: u64) -> u64 {
    n.div_ceil(BLOCK_SIZE) * BLOCK_SIZE
}

/// A source of byte ranges: a local file or a remote URL behind a
/// [`RangeFetcher`]. Both local and remote sources open a container in
/// exactly two range reads.
pub trait RangeRead: Send + Sync {
    /// Read exactly `len` bytes starting at `offset`.
    ///
    /// # Errors
    /// Returns [`TarError::Io`] on underlying I/O failure.
    fn read_range(&self, offset: u64, len: u64) -> Result<Vec<u8>, TarError>;
}

/// Reads ranges from a local file via a shared, mutex-guarded handle.
pub struct LocalFileSource(Mutex<File>);

impl LocalFileSource {
    /// Open `path` for random-access range reads.
    ///
    /// # Errors
    /// Returns [`TarError::Io`] if `path` cannot be opened.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, TarError> {
        Ok(Self(Mutex::new(File::open(path)?)))
    }
}

impl RangeRead for LocalFileSource {
    fn read_range(&self, offset: u64, len: u64) -> Result<Vec<u8>, TarError> {
        let mut file = self.0.lock().unwrap();
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; usize::try_from(len).unwrap()];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }
}

/// Reads ranges from a remote URL via a [`RangeFetcher`], with the §4.4
/// retry law applied to every range read.
pub struct RemoteSource {
    url: String,
    fetcher: Arc<dyn RangeFetcher>,
    cancel: Option<CancellationToken>,
}

impl RemoteSource {
    /// Build a remote source over `url`, fetching ranges through `fetcher`.
    #[must_use]
    pub fn new(url: impl Into<String>, fetcher: Arc<dyn RangeFetcher>) -> Self {
        Self {
            url: url.into(),
            fetcher,
            cancel: None,
        }
    }

    /// Attach a cancellation token checked between retry attempts.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

impl RangeRead for RemoteSource {
    fn read_range(&self, offset: u64, len: u64) -> Result<Vec<u8>, TarError> {
        fetch_with_retry(self.fetcher.as_ref(), &self.url, offset, len, self.cancel.as_ref())
            .map_err(|e| TarError::CorruptContainer(format!("range read failed: {e}")))
    }
}

/// One entry of the tar member table (§3 "Tar member table").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TarMemberEntry {
    /// Byte offset of the member's 512-byte tar header.
    pub header_offset: u64,
    /// Byte offset of the member's data region (`header_offset + 512`).
    pub data_offset: u64,
    /// Number of live data bytes (excluding whitespace padding).
    pub data_size: u64,
    /// Total capacity of the data region; `>= data_size` for growable members.
    pub padded_capacity: u64,
}

/// The `.tar_index.json` document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TarIndex {
    /// Every live member, keyed by name. Tombstoned members are removed from
    /// this map once moved under `./trash/`; their old header still exists
    /// on disk but is no longer reachable by name.
    pub members: BTreeMap<String, TarMemberEntry>,
}

/// The `.tar_entry.json` document: just enough to locate `.tar_index.json`
/// in a single further range read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TarEntryPointer {
    /// The index member's location.
    pub index: TarMemberEntry,
}

/// Open a container for reading: two range reads, as §4.2 requires.
///
/// # Errors
/// Returns [`TarError::CorruptContainer`] if the first member is not exactly
/// a 1024-byte `.tar_entry.json`, or if either document fails to parse.
pub fn open_container<R: RangeRead>(source: &R) -> Result<(TarEntryPointer, TarIndex), TarError> {
    let first = source.read_range(0, ENTRY_MEMBER_SIZE)?;
    if first.len() as u64 != ENTRY_MEMBER_SIZE {
        return Err(TarError::CorruptContainer(
            "first range read did not return 1024 bytes".to_string(),
        ));
    }
    let header = parse_header(&first[..512])?;
    if header.name != ENTRY_NAME {
        return Err(TarError::CorruptContainer(format!(
            "first member must be {ENTRY_NAME}, found {}",
            header.name
        )));
    }
    let data = trim_trailing_whitespace(&first[512..1024]);
    let entry: TarEntryPointer = serde_json::from_slice(data)?;

    let index_bytes = source.read_range(entry.index.data_offset, entry.index.data_size)?;
    let index: TarIndex = serde_json::from_slice(&index_bytes)?;
    Ok((entry, index))
}

#[derive(Debug)]
struct ParsedHeader {
    name: String,
    size: u64,
}

fn octal_to_u64(field: &[u8]) -> u64 {
    let text: String = field
        .iter()
        .take_while(|&&b| b != 0)
        .map(|&b| b as char)
        .collect();
    u64::from_str_radix(text.trim(), 8).unwrap_or(0)
}

fn parse_header(block: &[u8]) -> Result<ParsedHeader, TarError> {
    if block.len() != 512 {
        return Err(TarError::CorruptContainer("short header block".to_string()));
    }
    if block.iter().all(|&b| b == 0) {
        return Err(TarError::CorruptContainer("empty header block".to_string()));
    }
    let name_bytes = &block[0..100];
    let name_end = name_bytes.iter().position(|&b| b == 0).unwrap_or(100);
    let name = String::from_utf8_lossy(&name_bytes[..name_end]).into_owned();
    let size = octal_to_u64(&block[124..136]);
    Ok(ParsedHeader { name, size })
}

fn trim_trailing_whitespace(bytes: &[u8]) -> &[u8] {
    let end = bytes
        .iter()
        .rposition(|&b| !b.is_ascii_whitespace() && b != 0)
        .map_or(0, |p| p + 1);
    &bytes[..end]
}

fn write_octal_field(buf: &mut [u8], value: u64) {
    let width = buf.len() - 1;
    let text = format!("{value:0width$o}");
    let text = &text[text.len().saturating_sub(width)..];
    buf[..text.len()].copy_from_slice(text.as_bytes());
    buf[text.len()] = 0;
}

fn build_header(name: &str, size: u64, typeflag: u8) -> [u8; 512] {
    assert!(name.len() < 100, "member name too long for a ustar header: {name}");
    let mut block = [0u8; 512];
    block[..name.len()].copy_from_slice(name.as_bytes());
    write_octal_field(&mut block[100..108], 0o644); // mode
    write_octal_field(&mut block[108..116], 0); // uid
    write_octal_field(&mut block[116..124], 0); // gid
    write_octal_field(&mut block[124..136], size);
    write_octal_field(&mut block[136..148], 0); // mtime
    block[148..156].copy_from_slice(b"        "); // chksum placeholder (8 spaces)
    block[156] = typeflag;
    block[257..263].copy_from_slice(b"ustar\0");
    block[263..265].copy_from_slice(b"00");

    let checksum: u32 = block.iter().map(|&b| u32::from(b)).sum();
    let checksum_text = format!("{checksum:06o}\0 ");
    block[148..156].copy_from_slice(checksum_text.as_bytes());
    block
}

/// A local, writable LINDI tar container.
///
/// Writers hold this for the duration of a grow-or-append cycle (§4.2, §5);
/// there is no internal locking here because [`crate::store::ReferenceStore`]
/// serializes writers above this layer with its own single-writer lock.
pub struct TarContainer {
    file: File,
    path: PathBuf,
    index: TarIndex,
    /// Offset of the first of the two trailing zero blocks.
    end_offset: u64,
    /// Set if an index write failed after member data had already been
    /// mutated; the archive is well-formed but the index may be stale.
    dirty: bool,
}

impl TarContainer {
    /// Create a brand-new container at `path` containing `lindi.json` (the
    /// manifest, growable) and any number of fixed-size chunk members.
    ///
    /// # Errors
    /// Returns [`TarError::Io`] on filesystem failure, or
    /// [`TarError::Json`] if the initial index fails to serialize.
    pub fn create(
        path: impl Into<PathBuf>,
        manifest: &[u8],
        manifest_capacity: u64,
        chunks: &[(String, Vec<u8>)],
    ) -> Result<Self, TarError> {
        let path = path.into();
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .read(true)
            .truncate(true)
            .open(&path)?;
        let mut container = Self {
            file,
            path,
            index: TarIndex::default(),
            end_offset: ENTRY_MEMBER_SIZE,
            dirty: false,
        };

        // Reserve the index member first; its own size depends on what it
        // ends up describing (including itself and lindi.json), so size it
        // generously and let ordinary growth handle anything that doesn't fit.
        let index_capacity = round_up_block(4096);
        let index_header_offset = container.end_offset;
        container.append_member_space(INDEX_NAME, index_capacity)?;
        container.index.members.insert(
            INDEX_NAME.to_string(),
            TarMemberEntry {
                header_offset: index_header_offset,
                data_offset: index_header_offset + BLOCK_SIZE,
                data_size: 0,
                padded_capacity: index_capacity,
            },
        );

        let manifest_capacity = round_up_block(manifest_capacity.max(manifest.len() as u64));
        let manifest_header_offset = container.end_offset;
        container.append_member_space("lindi.json", manifest_capacity)?;
        container.index.members.insert(
            "lindi.json".to_string(),
            TarMemberEntry {
                header_offset: manifest_header_offset,
                data_offset: manifest_header_offset + BLOCK_SIZE,
                data_size: 0,
                padded_capacity: manifest_capacity,
            },
        );

        for (name, bytes) in chunks {
            let capacity = round_up_block(bytes.len() as u64);
            let header_offset = container.end_offset;
            container.append_member_space(name, capacity)?;
            container.index.members.insert(
                name.clone(),
                TarMemberEntry {
                    header_offset,
                    data_offset: header_offset + BLOCK_SIZE,
                    data_size: 0,
                    padded_capacity: capacity,
                },
            );
        }

        container.write_eof_markers()?;
        container.write_member_data("lindi.json", manifest)?;
        for (name, bytes) in chunks {
            container.write_member_data(name, bytes)?;
        }
        container.write_index()?;
        Ok(container)
    }

    /// Open an existing container for read-write access.
    ///
    /// # Errors
    /// Returns [`TarError::CorruptContainer`] if the container does not open
    /// per §4.2, or [`TarError::Io`] on filesystem failure.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, TarError> {
        let path = path.into();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let source = LocalFileSource(Mutex::new(file.try_clone()?));
        let (_entry, index) = open_container(&source)?;
        let end_offset = index
            .members
            .values()
            .map(|m| m.header_offset + BLOCK_SIZE + m.padded_capacity)
            .max()
            .unwrap_or(ENTRY_MEMBER_SIZE);
        Ok(Self {
            file,
            path,
            index,
            end_offset,
            dirty: false,
        })
    }

    /// True if the last write left the index possibly stale (best-effort
    /// recovery signal; see §7 "archive is flagged dirty").
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// The current member table.
    #[must_use]
    pub fn index(&self) -> &TarIndex {
        &self.index
    }

    /// Read a live member's current data bytes.
    ///
    /// # Errors
    /// Returns [`TarError::MemberNotFound`] if `name` is not a live member.
    pub fn read_member(&mut self, name: &str) -> Result<Vec<u8>, TarError> {
        let entry = *self
            .index
            .members
            .get(name)
            .ok_or_else(|| TarError::MemberNotFound(name.to_string()))?;
        self.file.seek(SeekFrom::Start(entry.data_offset))?;
        let mut buf = vec![0u8; usize::try_from(entry.data_size).unwrap()];
        self.file.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Write new bytes to a growable member, growing in place if they fit
    /// within the current `padded_capacity`, or performing the tombstone +
    /// append overflow procedure otherwise (§4.2). The index is always
    /// written last.
    ///
    /// # Errors
    /// Returns [`TarError::MemberNotFound`] if `name` is not a live member,
    /// or an I/O/serialization error from the underlying writes.
    pub fn grow_member(&mut self, name: &str, bytes: &[u8]) -> Result<(), TarError> {
        let entry = *self
            .index
            .members
            .get(name)
            .ok_or_else(|| TarError::MemberNotFound(name.to_string()))?;

        if (bytes.len() as u64) <= entry.padded_capacity {
            self.write_member_data(name, bytes)?;
        } else {
            self.tombstone(name, entry)?;
            let new_capacity = round_up_block((bytes.len() as u64) * 2);
            let header_offset = self.end_offset;
            self.append_member_space(name, new_capacity)?;
            self.write_eof_markers()?;
            self.index.members.insert(
                name.to_string(),
                TarMemberEntry {
                    header_offset,
                    data_offset: header_offset + BLOCK_SIZE,
                    data_size: 0,
                    padded_capacity: new_capacity,
                },
            );
            self.write_member_data(name, bytes)?;
        }
        self.write_index()
    }

    /// Append a brand-new fixed-capacity member (used by the staging area
    /// when finalizing newly written chunks, §4.5).
    ///
    /// # Errors
    /// Returns an I/O or serialization error.
    pub fn append_member(&mut self, name: &str, bytes: &[u8]) -> Result<(), TarError> {
        let capacity = round_up_block(bytes.len() as u64);
        let header_offset = self.end_offset;
        self.append_member_space(name, capacity)?;
        self.write_eof_markers()?;
        self.index.members.insert(
            name.to_string(),
            TarMemberEntry {
                header_offset,
                data_offset: header_offset + BLOCK_SIZE,
                data_size: 0,
                padded_capacity: capacity,
            },
        );
        self.write_member_data(name, bytes)?;
        self.write_index()
    }

    fn tombstone(&mut self, name: &str, entry: TarMemberEntry) -> Result<(), TarError> {
        let tombstone_name = format!("{TRASH_PREFIX}{name}");
        let header = build_header(&tombstone_name, entry.data_size, b'0');
        self.file.seek(SeekFrom::Start(entry.header_offset))?;
        self.file.write_all(&header)?;
        self.index.members.remove(name);
        Ok(())
    }

    fn append_member_space(&mut self, name: &str, capacity: u64) -> Result<(), TarError> {
        let header_offset = self.end_offset;
        let header = build_header(name, 0, b'0');
        self.file.seek(SeekFrom::Start(header_offset))?;
        self.file.write_all(&header)?;
        let padding = vec![b' '; usize::try_from(capacity).unwrap()];
        self.file.write_all(&padding)?;
        self.end_offset = header_offset + BLOCK_SIZE + capacity;
        Ok(())
    }

    fn write_member_data(&mut self, name: &str, bytes: &[u8]) -> Result<(), TarError> {
        let entry = *self
            .index
            .members
            .get(name)
            .ok_or_else(|| TarError::MemberNotFound(name.to_string()))?;
        assert!(
            bytes.len() as u64 <= entry.padded_capacity,
            "caller must grow the member before writing data that exceeds its capacity"
        );
        self.file.seek(SeekFrom::Start(entry.data_offset))?;
        self.file.write_all(bytes)?;
        let pad_len = entry.padded_capacity - bytes.len() as u64;
        if pad_len > 0 {
            self.file.write_all(&vec![b' '; usize::try_from(pad_len).unwrap()])?;
        }
        self.file.seek(SeekFrom::Start(entry.header_offset))?;
        let header = build_header(name, bytes.len() as u64, b'0');
        self.file.write_all(&header)?;

        let mut updated = entry;
        updated.data_size = bytes.len() as u64;
        self.index.members.insert(name.to_string(), updated);
        Ok(())
    }

    fn write_eof_markers(&mut self) -> Result<(), TarError> {
        self.file.seek(SeekFrom::Start(self.end_offset))?;
        self.file.write_all(&[0u8; BLOCK_SIZE as usize * 2])?;
        self.file.set_len(self.end_offset + BLOCK_SIZE * 2)?;
        Ok(())
    }

    /// Serialize and write `.tar_index.json`, growing or overflowing it like
    /// any other member, then rewrite `.tar_entry.json` in place to point at
    /// its (possibly new) location. The index write is always the last
    /// durable step of a mutation (§4.2, §7).
    fn write_index(&mut self) -> Result<(), TarError> {
        let payload = serde_json::to_vec(&self.index)?;
        let result = self.write_index_member(&payload);
        match result {
            Ok(()) => {
                self.dirty = false;
                self.write_entry_pointer()
            }
            Err(err) => {
                self.dirty = true;
                Err(err)
            }
        }
    }

    fn write_index_member(&mut self, payload: &[u8]) -> Result<(), TarError> {
        let entry = *self
            .index
            .members
            .get(INDEX_NAME)
            .expect("index member always present");
        if (payload.len() as u64) <= entry.padded_capacity {
            self.write_raw_member(INDEX_NAME, entry, payload)
        } else {
            self.tombstone(INDEX_NAME, entry)?;
            let new_capacity = round_up_block((payload.len() as u64) * 2);
            let header_offset = self.end_offset;
            self.append_member_space(INDEX_NAME, new_capacity)?;
            self.write_eof_markers()?;
            let new_entry = TarMemberEntry {
                header_offset,
                data_offset: header_offset + BLOCK_SIZE,
                data_size: 0,
                padded_capacity: new_capacity,
            };
            self.index.members.insert(INDEX_NAME.to_string(), new_entry);
            self.write_raw_member(INDEX_NAME, new_entry, payload)
        }
    }

    /// Writes `payload` into a known member location without touching the
    /// in-memory index entry's `data_size` bookkeeping recursively (used only
    /// for the index member itself, whose entry is mutated directly).
    fn write_raw_member(&mut self, name: &str, entry: TarMemberEntry, payload: &[u8]) -> Result<(), TarError> {
        self.file.seek(SeekFrom::Start(entry.data_offset))?;
        self.file.write_all(payload)?;
        let pad_len = entry.padded_capacity - payload.len() as u64;
        if pad_len > 0 {
            self.file.write_all(&vec![b' '; usize::try_from(pad_len).unwrap()])?;
        }
        self.file.seek(SeekFrom::Start(entry.header_offset))?;
        let header = build_header(name, payload.len() as u64, b'0');
        self.file.write_all(&header)?;
        let mut updated = entry;
        updated.data_size = payload.len() as u64;
        self.index.members.insert(name.to_string(), updated);
        Ok(())
    }

    fn write_entry_pointer(&mut self) -> Result<(), TarError> {
        let index_entry = *self.index.members.get(INDEX_NAME).expect("index member always present");
        let pointer = TarEntryPointer { index: index_entry };
        let payload = serde_json::to_vec(&pointer)?;
        if payload.len() as u64 > ENTRY_MEMBER_SIZE - BLOCK_SIZE {
            return Err(TarError::CorruptContainer(
                ".tar_entry.json pointer no longer fits in its fixed 512-byte data region".to_string(),
            ));
        }
        let header = build_header(ENTRY_NAME, payload.len() as u64, b'0');
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&header)?;
        let mut data = payload;
        data.resize(512, b' ');
        self.file.write_all(&data)?;
        Ok(())
    }

    /// The path this container is backed by.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_and_reopen_with_two_requests() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.lindi.tar");
        TarContainer::create(&path, br#"{"version":1,"refs":{}}"#, 65536, &[]).unwrap();

        let source = LocalFileSource::open(&path).unwrap();
        let (_entry, index) = open_container(&source).unwrap();
        assert!(index.members.contains_key("lindi.json"));
        assert!(index.members.contains_key(INDEX_NAME));
    }

    #[test]
    fn grow_in_place_preserves_other_offsets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.lindi.tar");
        let mut container =
            TarContainer::create(&path, br#"{"version":1,"refs":{}}"#, 65536, &[("chunk0".to_string(), vec![1, 2, 3])]).unwrap();
        let chunk_offset_before = container.index().members["chunk0"].header_offset;

        let bigger = serde_json::to_vec(&serde_json::json!({"version": 1, "refs": {"a": "b"}})).unwrap();
        container.grow_member("lindi.json", &bigger).unwrap();

        assert_eq!(container.read_member("lindi.json").unwrap(), bigger);
        assert_eq!(container.index().members["chunk0"].header_offset, chunk_offset_before);
    }

    #[test]
    fn overflow_tombstones_and_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.lindi.tar");
        let mut container = TarContainer::create(&path, b"{}", 512, &[]).unwrap();
        let old_offset = container.index().members["lindi.json"].header_offset;

        let huge = vec![b'x'; 4096];
        container.grow_member("lindi.json", &huge).unwrap();

        let new_entry = container.index().members["lindi.json"];
        assert_ne!(new_entry.header_offset, old_offset);
        assert_eq!(container.read_member("lindi.json").unwrap(), huge);

        let source = LocalFileSource::open(&path).unwrap();
        let (_entry, index) = open_container(&source).unwrap();
        assert_eq!(index.members["lindi.json"].header_offset, new_entry.header_offset);
        assert!(!index.members.values().any(|m| m.header_offset == old_offset));
    }

    #[test]
    fn reopen_exposes_live_chunk_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.lindi.tar");
        TarContainer::create(
            &path,
            b"{}",
            512,
            &[("a/b/0".to_string(), vec![9, 9, 9, 9])],
        )
        .unwrap();

        let mut container = TarContainer::open(&path).unwrap();
        assert_eq!(container.read_member("a/b/0").unwrap(), vec![9, 9, 9, 9]);
    }
}
