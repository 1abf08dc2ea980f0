//! Top-level RFS ↔ container binding (§4.6): open or write a LINDI container
//! in any of its three on-disk forms — a bare `.lindi.json` document, a
//! random-access `.lindi.tar`, or a `.lindi.d` directory.

use std::path::{Path, PathBuf};
use std::sync::Arc;

pub use crate::error::LindiError;
use crate::fetch::{DefaultRangeFetcher, RangeFetcher};
use crate::rfs::{Ref, Rfs};
use crate::staging::{finalize_to_tar, StagingArea};
use crate::store::{Backing, ReferenceStore};
use crate::tar::{open_container, LocalFileSource, RangeRead, TarError};

/// The three on-disk forms a LINDI container may take (§2, §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerFormat {
    /// A bare `.lindi.json` RFS document; no self-referential ranges are resolvable.
    Json,
    /// A random-access tar archive, `.lindi.tar`.
    Tar,
    /// A directory, `.lindi.d`, holding `lindi.json` and a single `lindi.blob`.
    Dir,
}

fn detect_format(path: &Path) -> ContainerFormat {
    if path.is_dir() {
        return ContainerFormat::Dir;
    }
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
    if name.ends_with(".tar") {
        ContainerFormat::Tar
    } else {
        ContainerFormat::Json
    }
}

fn load(path: &Path) -> Result<(Rfs, Backing), LindiError> {
    match detect_format(path) {
        ContainerFormat::Json => {
            let text = std::fs::read_to_string(path)?;
            Ok((Rfs::parse(&text)?, Backing::Json))
        }
        ContainerFormat::Tar => {
            let source = Arc::new(LocalFileSource::open(path)?);
            let (_entry, index) = open_container(source.as_ref())?;
            let manifest_entry = index
                .members
                .get("lindi.json")
                .ok_or_else(|| LindiError::Tar(TarError::MemberNotFound("lindi.json".to_string())))?;
            let manifest_bytes = source.read_range(manifest_entry.data_offset, manifest_entry.data_size)?;
            let text = String::from_utf8(manifest_bytes)
                .map_err(|_| LindiError::Tar(TarError::CorruptContainer("lindi.json is not valid UTF-8".to_string())))?;
            Ok((Rfs::parse(&text)?, Backing::Tar { source, index }))
        }
        ContainerFormat::Dir => {
            let text = std::fs::read_to_string(path.join("lindi.json"))?;
            let blob_path = path.join("lindi.blob");
            Ok((Rfs::parse(&text)?, Backing::Dir { blob_path }))
        }
    }
}

/// Open a LINDI container at `path` for reading (§4.6).
///
/// # Errors
/// Returns [`LindiError`] if the container cannot be opened or its manifest fails to parse.
pub fn open_lindi(path: impl AsRef<Path>) -> Result<ReferenceStore, LindiError> {
    let (rfs, backing) = load(path.as_ref())?;
    Ok(ReferenceStore::new(rfs, backing, true, None))
}

/// Open a LINDI container at `path` for reading and writing. New chunks
/// written through the resulting store are staged under `staging_dir`
/// (§4.5) until [`write_lindi`] finalizes them.
///
/// # Errors
/// Returns [`LindiError`] on the same conditions as [`open_lindi`], or if the
/// staging area cannot be created.
pub fn open_lindi_read_write(
    path: impl AsRef<Path>,
    staging_dir: impl AsRef<Path>,
) -> Result<ReferenceStore, LindiError> {
    let (rfs, backing) = load(path.as_ref())?;
    let staging = StagingArea::new(staging_dir)?;
    Ok(ReferenceStore::new(rfs, backing, false, Some(staging)).with_fetcher(Arc::new(DefaultRangeFetcher::new())))
}

/// Write `rfs` to `output_path` in `format`, finalizing any staged `file://`
/// chunk references into the target container (§4.5, §4.6).
///
/// # Errors
/// Returns [`LindiError`] on I/O or serialization failure.
pub fn write_lindi(rfs: Rfs, output_path: impl AsRef<Path>, format: ContainerFormat) -> Result<(), LindiError> {
    let output_path = output_path.as_ref();
    match format {
        ContainerFormat::Json => {
            if rfs.refs.values().any(|r| matches!(r, Ref::External { url, .. } if url.starts_with("file://"))) {
                return Err(LindiError::UnknownFormat(
                    "json".to_string() + ": cannot finalize staged chunks without a container to hold them",
                ));
            }
            std::fs::write(output_path, rfs.to_json()?)?;
            Ok(())
        }
        ContainerFormat::Tar => Ok(finalize_to_tar(rfs, output_path)?),
        ContainerFormat::Dir => write_lindi_dir(rfs, output_path),
    }
}

fn write_lindi_dir(mut rfs: Rfs, output_dir: &Path) -> Result<(), LindiError> {
    std::fs::create_dir_all(output_dir)?;
    let blob_path = output_dir.join("lindi.blob");
    let tmp_blob = tempfile::Builder::new()
        .prefix(".lindi-blob-")
        .tempfile_in(output_dir)?;

    let mut chunks = Vec::new();
    for (key, r) in &rfs.refs {
        if let Ref::External { url, .. } = r {
            if let Some(path) = url.strip_prefix("file://") {
                chunks.push((key.clone(), path.to_string()));
            }
        }
    }

    let mut offset = 0u64;
    {
        use std::io::Write;
        let mut writer = std::io::BufWriter::new(tmp_blob.as_file());
        for (key, path) in &chunks {
            let bytes = std::fs::read(path)?;
            writer.write_all(&bytes)?;
            rfs.refs.insert(
                key.clone(),
                Ref::External {
                    url: crate::rfs::SELF_REFERENCE_URL.to_string(),
                    offset,
                    size: bytes.len() as u64,
                },
            );
            offset += bytes.len() as u64;
        }
        writer.flush()?;
    }
    tmp_blob.persist(&blob_path).map_err(|e| e.error)?;

    let manifest_path = output_dir.join("lindi.json");
    let tmp_manifest = tempfile::Builder::new()
        .prefix(".lindi-json-")
        .tempfile_in(output_dir)?;
    std::fs::write(tmp_manifest.path(), rfs.to_json()?)?;
    tmp_manifest.persist(&manifest_path).map_err(|e| e.error)?;
    Ok(())
}
