//! A minimal named-codec dispatch (§6 "Zarr codec catalog exposing
//! `encode`/`decode`"). The full Zarr codec catalog is an external
//! collaborator in production; this module exists so the HDF5 translator's
//! codec-name mapping (§4.3) and the hierarchy layer's decode path have
//! something concrete to call in tests and simple deployments.

use std::io::{Read, Write};

use thiserror::Error;

/// Errors applying a named codec.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The codec name is not one this dispatch recognizes.
    #[error("unrecognised codec: {0}")]
    Unknown(String),
    /// The codec's configuration (e.g. `elementsize` for shuffle) was invalid.
    #[error("invalid codec configuration: {0}")]
    InvalidConfig(String),
    /// Underlying compression/decompression failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A named codec and its configuration, mirroring the `{id, ...}` shape of a
/// Zarr v2 `compressor`/`filters` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Codec {
    /// No-op passthrough.
    Raw,
    /// DEFLATE via `flate2`.
    #[cfg(feature = "gzip")]
    Gzip,
    /// Zstandard via the `zstd` crate.
    #[cfg(feature = "zstd")]
    Zstd,
    /// Byte-shuffle filter with the given element size, in bytes.
    Shuffle {
        /// Bytes per element being shuffled.
        element_size: usize,
    },
    /// Blosc is recognized by name but treated as an opaque passthrough: the
    /// real blosc codec is the external collaborator's job in production
    /// (§6); this dispatch exists only so translation/tests have a concrete
    /// stand-in to name.
    Blosc,
}

impl Codec {
    /// Decode bytes previously produced by [`Codec::encode`].
    ///
    /// # Errors
    /// Returns [`CodecError`] on malformed input or an unsupported codec.
    pub fn decode(&self, bytes: &[u8]) -> Result<Vec<u8>, CodecError> {
        match self {
            Codec::Raw | Codec::Blosc => Ok(bytes.to_vec()),
            #[cfg(feature = "gzip")]
            Codec::Gzip => {
                let mut out = Vec::new();
                flate2::read::GzDecoder::new(bytes).read_to_end(&mut out)?;
                Ok(out)
            }
            #[cfg(feature = "zstd")]
            Codec::Zstd => Ok(zstd::decode_all(bytes)?),
            Codec::Shuffle { element_size } => unshuffle(bytes, *element_size),
        }
    }

    /// Encode bytes with this codec.
    ///
    /// # Errors
    /// Returns [`CodecError`] on an unsupported codec or I/O failure.
    pub fn encode(&self, bytes: &[u8]) -> Result<Vec<u8>, CodecError> {
        match self {
            Codec::Raw | Codec::Blosc => Ok(bytes.to_vec()),
            #[cfg(feature = "gzip")]
            Codec::Gzip => {
                let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
                encoder.write_all(bytes)?;
                Ok(encoder.finish()?)
            }
            #[cfg(feature = "zstd")]
            Codec::Zstd => Ok(zstd::encode_all(bytes, 0)?),
            Codec::Shuffle { element_size } => shuffle(bytes, *element_size),
        }
    }

    /// Map an HDF5 filter name (as reported by the HDF5 reader's filter
    /// pipeline, §4.3 "Codec selection") to the codec this dispatch applies.
    /// Returns `None` for a filter this dispatch does not recognize, which
    /// the translator treats as "unknown filter" (§4.3, falls back to
    /// `_EXTERNAL_ARRAY_LINK`).
    #[must_use]
    pub fn from_hdf5_filter_name(name: &str, element_size: usize) -> Option<Self> {
        match name {
            "deflate" | "gzip" => {
                #[cfg(feature = "gzip")]
                {
                    Some(Codec::Gzip)
                }
                #[cfg(not(feature = "gzip"))]
                {
                    None
                }
            }
            "zstd" => {
                #[cfg(feature = "zstd")]
                {
                    Some(Codec::Zstd)
                }
                #[cfg(not(feature = "zstd"))]
                {
                    None
                }
            }
            "shuffle" => Some(Codec::Shuffle { element_size }),
            "blosc" => Some(Codec::Blosc),
            _ => None,
        }
    }

    /// The Zarr v2 `{id: ...}` compressor/filter name for this codec.
    #[must_use]
    pub fn zarr_id(&self) -> &'static str {
        match self {
            Codec::Raw => "raw",
            #[cfg(feature = "gzip")]
            Codec::Gzip => "gzip",
            #[cfg(feature = "zstd")]
            Codec::Zstd => "zstd",
            Codec::Shuffle { .. } => "shuffle",
            Codec::Blosc => "blosc",
        }
    }
}

fn shuffle(bytes: &[u8], element_size: usize) -> Result<Vec<u8>, CodecError> {
    if element_size == 0 || bytes.len() % element_size != 0 {
        return Err(CodecError::InvalidConfig(format!(
            "buffer of length {} is not a multiple of element_size {element_size}",
            bytes.len()
        )));
    }
    let count = bytes.len() / element_size;
    let mut out = vec![0u8; bytes.len()];
    for byte_index in 0..element_size {
        for elem in 0..count {
            out[byte_index * count + elem] = bytes[elem * element_size + byte_index];
        }
    }
    Ok(out)
}

fn unshuffle(bytes: &[u8], element_size: usize) -> Result<Vec<u8>, CodecError> {
    if element_size == 0 || bytes.len() % element_size != 0 {
        return Err(CodecError::InvalidConfig(format!(
            "buffer of length {} is not a multiple of element_size {element_size}",
            bytes.len()
        )));
    }
    let count = bytes.len() / element_size;
    let mut out = vec![0u8; bytes.len()];
    for byte_index in 0..element_size {
        for elem in 0..count {
            out[elem * element_size + byte_index] = bytes[byte_index * count + elem];
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_round_trips() {
        let codec = Codec::Raw;
        let data = b"hello world";
        assert_eq!(codec.decode(&codec.encode(data).unwrap()).unwrap(), data);
    }

    #[cfg(feature = "gzip")]
    #[test]
    fn gzip_round_trips() {
        let codec = Codec::Gzip;
        let data = b"hello world, compressed hopefully";
        let encoded = codec.encode(data).unwrap();
        assert_ne!(encoded, data);
        assert_eq!(codec.decode(&encoded).unwrap(), data);
    }

    #[cfg(feature = "zstd")]
    #[test]
    fn zstd_round_trips() {
        let codec = Codec::Zstd;
        let data = b"hello world, compressed hopefully, with zstd this time";
        let encoded = codec.encode(data).unwrap();
        assert_eq!(codec.decode(&encoded).unwrap(), data);
    }

    #[test]
    fn shuffle_round_trips() {
        let codec = Codec::Shuffle { element_size: 4 };
        let data: Vec<u8> = (0..16).collect();
        let shuffled = codec.encode(&data).unwrap();
        assert_ne!(shuffled, data);
        assert_eq!(codec.decode(&shuffled).unwrap(), data);
    }

    #[test]
    fn unknown_hdf5_filter_is_none() {
        assert!(Codec::from_hdf5_filter_name("fletcher32", 4).is_none());
    }
}
