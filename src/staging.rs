//! The staging area (§4.5): collects newly written chunks for a store opened
//! in read-write mode, then finalizes them into an updated LINDI container.

use std::path::{Path, PathBuf};

pub use crate::error::StagingError;
use crate::rfs::{Ref, Rfs};
use crate::tar::TarContainer;

/// A scoped directory that collects content-addressed chunk files produced
/// by writes, released on drop via [`tempfile::TempDir`] (§4.5 "guaranteed to
/// release its temporary files on all exit paths").
pub struct StagingArea {
    dir: tempfile::TempDir,
}

impl StagingArea {
    /// Create a staging area rooted under `base_dir`.
    ///
    /// # Errors
    /// Returns [`StagingError::Io`] if the scratch directory cannot be created.
    pub fn new(base_dir: impl AsRef<Path>) -> Result<Self, StagingError> {
        let dir = tempfile::Builder::new()
            .prefix("lindi-staging-")
            .tempdir_in(base_dir)?;
        Ok(Self { dir })
    }

    /// Write `bytes` under a content-addressed filename and return its path.
    ///
    /// # Errors
    /// Returns [`StagingError::Io`] if the write fails.
    pub fn stage_chunk(&mut self, bytes: &[u8]) -> Result<PathBuf, StagingError> {
        let digest = blake3::hash(bytes).to_hex().to_string();
        let path = self.dir.path().join(&digest);
        // Re-staging identical bytes is a no-op; the digest already names them.
        if !path.exists() {
            let mut tmp = tempfile::NamedTempFile::new_in(self.dir.path())?;
            use std::io::Write;
            tmp.write_all(bytes)?;
            tmp.flush()?;
            tmp.persist(&path).map_err(|e| e.error)?;
        }
        Ok(path)
    }

    /// The staging directory's path.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}

/// Finalize `rfs` (whose `set()` calls may have produced `file://`-staged
/// external refs) into a fresh `.lindi.tar` at `output_path`: every staged
/// chunk is appended as a tar member, and the manifest's references to
/// staging paths are rewritten to self-referential references pointing at
/// the new in-archive offsets (§4.5).
///
/// # Errors
/// Returns [`StagingError`] on I/O or serialization failure. Finalization is
/// atomic at the outermost file via tmpfile-then-rename.
pub fn finalize_to_tar(mut rfs: Rfs, output_path: impl AsRef<Path>) -> Result<(), StagingError> {
    let output_path = output_path.as_ref();
    let tmp_dir = output_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let tmp_path = tempfile::Builder::new()
        .prefix(".lindi-finalize-")
        .suffix(".tar")
        .tempfile_in(tmp_dir)?
        .into_temp_path();

    let mut chunks = Vec::new();
    for (key, r) in &rfs.refs {
        if let Ref::External { url, .. } = r {
            if let Some(path) = url.strip_prefix("file://") {
                chunks.push((key.clone(), path.to_string()));
            }
        }
    }
    let mut chunk_bytes = Vec::with_capacity(chunks.len());
    for (key, path) in &chunks {
        chunk_bytes.push((key.clone(), std::fs::read(path)?));
    }

    let manifest_placeholder = serde_json::to_vec(&rfs)?;
    let mut container = TarContainer::create(
        &tmp_path,
        &manifest_placeholder,
        manifest_placeholder.len() as u64 * 2,
        &chunk_bytes,
    )?;

    for (key, _) in &chunks {
        let entry = container.index().members[key];
        rfs.refs.insert(
            key.clone(),
            Ref::External {
                url: crate::rfs::SELF_REFERENCE_URL.to_string(),
                offset: entry.data_offset,
                size: entry.data_size,
            },
        );
    }
    let manifest_final = serde_json::to_vec(&rfs)?;
    container.grow_member("lindi.json", &manifest_final)?;
    drop(container);

    tmp_path.persist(output_path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_chunk_is_content_addressed() {
        let dir = tempfile::tempdir().unwrap();
        let mut staging = StagingArea::new(dir.path()).unwrap();
        let path_a = staging.stage_chunk(b"hello").unwrap();
        let path_b = staging.stage_chunk(b"hello").unwrap();
        assert_eq!(path_a, path_b);
        assert_eq!(std::fs::read(&path_a).unwrap(), b"hello");
    }

    #[test]
    fn finalize_rewrites_staged_refs_self_referential() {
        let dir = tempfile::tempdir().unwrap();
        let mut staging = StagingArea::new(dir.path()).unwrap();
        let chunk_path = staging.stage_chunk(&[1, 2, 3, 4]).unwrap();

        let mut rfs = Rfs::new();
        rfs.set_inline("g/.zattrs", "{}");
        rfs.set_external(
            "g/d/0",
            format!("file://{}", chunk_path.display()),
            0,
            4,
        );

        let out_path = dir.path().join("out.lindi.tar");
        finalize_to_tar(rfs, &out_path).unwrap();

        let mut container = TarContainer::open(&out_path).unwrap();
        let manifest_bytes = container.read_member("lindi.json").unwrap();
        let final_rfs = Rfs::parse(std::str::from_utf8(&manifest_bytes).unwrap()).unwrap();
        assert!(final_rfs.refs.get("g/d/0").unwrap().is_self_referential());
    }
}
