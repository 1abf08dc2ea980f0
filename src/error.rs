//! Error taxonomy.
//!
//! One `thiserror`-derived enum per subsystem, composed with `#[from]` so `?`
//! propagates cleanly, and a top-level [`LindiError`] aggregating all of them
//! for the functions exposed at the crate root.

use thiserror::Error;

use crate::key::{StoreKeyError, StorePrefixError};

/// Errors parsing or validating a reference file system document.
#[derive(Debug, Error)]
pub enum RefsError {
    /// A `refs` entry was neither a string, a one-element array, nor a three-element array.
    #[error("invalid ref shape for key {0}")]
    InvalidRefShape(String),
    /// An inline base64 ref did not decode.
    #[error("invalid base64 for key {0}: {1}")]
    InvalidBase64(String, base64::DecodeError),
    /// A key in `refs` is not a valid store key.
    #[error(transparent)]
    InvalidKey(#[from] StoreKeyError),
    /// An external ref's `offset`/`size` violated `offset >= 0, size > 0`.
    #[error("invalid byte range for key {0}: offset={1} size={2}")]
    InvalidByteRange(String, u64, u64),
    /// The document failed to parse as JSON.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Errors from the reference store (§4.1 failure model).
#[derive(Debug, Error)]
pub enum StoreError {
    /// No ref exists for the requested key.
    #[error("key not found: {0}")]
    NotFound(String),
    /// A ref's declared size did not match the bytes actually returned.
    #[error("corrupt reference at {key}: declared size {declared}, got {actual}")]
    CorruptReference {
        /// The key whose reference is corrupt.
        key: String,
        /// The size declared by the reference.
        declared: u64,
        /// The size actually returned by the fetcher.
        actual: u64,
    },
    /// A write was attempted against a store opened read-only.
    #[error("store is read-only")]
    ReadOnly,
    /// The requested operation is not supported by this store.
    #[error("unsupported operation: {0}")]
    Unsupported(String),
    /// A self-referential ref pointed outside the bounds of any live container member.
    #[error("self-reference out of bounds: offset={0} size={1}")]
    SelfReferenceOutOfBounds(u64, u64),
    /// Failure fetching or reading bytes for a ref.
    #[error(transparent)]
    Fetch(#[from] crate::fetch::FetchError),
    /// Failure parsing the underlying reference document.
    #[error(transparent)]
    Refs(#[from] RefsError),
    /// Failure from the random-access tar container backing this store.
    #[error(transparent)]
    Tar(#[from] crate::tar::TarError),
    /// Failure staging a write.
    #[error(transparent)]
    Staging(#[from] crate::staging::StagingError),
    #[error(transparent)]
    /// An invalid key was supplied.
    InvalidKey(#[from] StoreKeyError),
    #[error(transparent)]
    /// An invalid prefix was supplied.
    InvalidPrefix(#[from] StorePrefixError),
    /// Underlying I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors from the random-access tar container (§4.2 failure model).
#[derive(Debug, Error)]
pub enum TarError {
    /// The archive is not a well-formed LINDI tar container.
    #[error("corrupt container: {0}")]
    CorruptContainer(String),
    /// A named member does not exist in the archive.
    #[error("member not found: {0}")]
    MemberNotFound(String),
    /// A write would exceed a member's padded capacity without going through overflow handling.
    #[error("member {0} overflowed its padded capacity")]
    Overflow(String),
    /// The container is flagged dirty after a failed atomic index update.
    #[error("container is dirty: a prior write did not complete atomically")]
    Dirty,
    /// Underlying I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// Failure (de)serializing `.tar_entry.json` / `.tar_index.json`.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Errors from the chunk fetcher (§4.4).
#[derive(Debug, Error)]
pub enum FetchError {
    /// All retry attempts were exhausted.
    #[error("fetch of {url} at offset {offset} size {size} failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        /// The URL that was being fetched.
        url: String,
        /// The byte offset requested.
        offset: u64,
        /// The byte size requested.
        size: u64,
        /// The number of attempts made.
        attempts: u32,
        /// The last underlying error.
        source: Box<FetchError>,
    },
    /// The fetcher returned a different number of bytes than requested.
    #[error("range size mismatch for {url}: requested {requested}, got {actual}")]
    SizeMismatch {
        /// The URL that was fetched.
        url: String,
        /// The size requested.
        requested: u64,
        /// The size actually returned.
        actual: u64,
    },
    /// A cancellation signal was observed.
    #[error("fetch cancelled")]
    Cancelled,
    /// The URL scheme is not supported by any fetcher.
    #[error("unsupported URL scheme: {0}")]
    UnsupportedScheme(String),
    /// Underlying I/O failure (local file reads).
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// Underlying HTTP failure.
    #[cfg(feature = "http")]
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

/// Errors from HDF5 translation (§4.3).
#[cfg(feature = "hdf5")]
#[derive(Debug, Error)]
pub enum Hdf5Error {
    /// The underlying HDF5 library reported an error.
    #[error(transparent)]
    Hdf5(#[from] hdf5_metno::Error),
    /// A feature could not be translated and no fallback applied (rare; most
    /// unsupported features degrade to a warning instead, see §4.3).
    #[error("unsupported HDF5 feature: {0}")]
    Unsupported(String),
    /// Failure building the emitted RFS.
    #[error(transparent)]
    Refs(#[from] RefsError),
    /// Failure serializing translated metadata or attributes.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Errors from the staging area (§4.5).
#[derive(Debug, Error)]
pub enum StagingError {
    /// Underlying I/O failure writing a staged chunk or finalizing output.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// Failure serializing the finalized manifest.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    /// Failure from the tar container during finalization.
    #[error(transparent)]
    Tar(#[from] crate::tar::TarError),
}

/// Top-level error type returned by `open_lindi` / `write_lindi` and friends.
#[derive(Debug, Error)]
pub enum LindiError {
    /// See [`RefsError`].
    #[error(transparent)]
    Refs(#[from] RefsError),
    /// See [`StoreError`].
    #[error(transparent)]
    Store(#[from] StoreError),
    /// See [`TarError`].
    #[error(transparent)]
    Tar(#[from] TarError),
    /// See [`FetchError`].
    #[error(transparent)]
    Fetch(#[from] FetchError),
    /// See [`Hdf5Error`].
    #[cfg(feature = "hdf5")]
    #[error(transparent)]
    Hdf5(#[from] Hdf5Error),
    /// See [`StagingError`].
    #[error(transparent)]
    Staging(#[from] StagingError),
    /// Underlying I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// Failure (de)serializing JSON.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    /// The requested on-disk format is not one of `json`, `tar`, `dir`.
    #[error("unrecognised LINDI format: {0}")]
    UnknownFormat(String),
}
