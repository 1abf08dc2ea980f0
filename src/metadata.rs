//! Zarr v2 JSON metadata shapes and the LINDI `.zattrs` extensions (§3).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A compressor or filter entry: `{"id": "...", ...configuration}`.
///
/// ```json
/// {"id": "blosc", "cname": "lz4", "clevel": 5, "shuffle": 1}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataV2 {
    /// The codec/filter name.
    pub id: String,
    /// Remaining configuration fields, flattened back out on serialization.
    #[serde(flatten)]
    pub configuration: Map<String, Value>,
}

impl MetadataV2 {
    /// The codec/filter name.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The remaining configuration fields.
    #[must_use]
    pub fn configuration(&self) -> &Map<String, Value> {
        &self.configuration
    }
}

/// `.zgroup` contents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupMetadataV2 {
    /// Always `2`.
    pub zarr_format: u64,
}

impl Default for GroupMetadataV2 {
    fn default() -> Self {
        Self { zarr_format: 2 }
    }
}

/// `.zarray` contents, restricted to what LINDI's translator and store need
/// (the full array read/write/codec-chain machinery is out of scope, §B).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArrayMetadataV2 {
    /// Always `2`.
    pub zarr_format: u64,
    /// Array shape.
    pub shape: Vec<u64>,
    /// Chunk shape.
    pub chunks: Vec<u64>,
    /// Zarr v2 dtype string, e.g. `"<f4"`, or `"|O"` for the compound-dtype
    /// variable-length UTF-8 representation (§3 `_COMPOUND_DTYPE`).
    pub dtype: String,
    /// The compressor, if any.
    pub compressor: Option<MetadataV2>,
    /// The fill value for uninitialized chunks.
    pub fill_value: Value,
    /// Memory layout, `"C"` or `"F"`.
    pub order: char,
    /// The filter pipeline, applied before the compressor.
    pub filters: Option<Vec<MetadataV2>>,
    /// The character joining chunk index components in a chunk key (§3 "Tar
    /// member table" keys such as `"1.23.45"`); LINDI always uses `.`.
    #[serde(default = "default_dimension_separator")]
    pub dimension_separator: char,
}

fn default_dimension_separator() -> char {
    '.'
}

impl ArrayMetadataV2 {
    /// Build array metadata for a regular (non-scalar, non-compound) array.
    #[must_use]
    pub fn new(shape: Vec<u64>, chunks: Vec<u64>, dtype: impl Into<String>) -> Self {
        Self {
            zarr_format: 2,
            shape,
            chunks,
            dtype: dtype.into(),
            compressor: None,
            fill_value: Value::Null,
            order: 'C',
            filters: None,
            dimension_separator: '.',
        }
    }

    /// The chunk key for a chunk index, e.g. `[1, 23, 45] -> "1.23.45"`, or
    /// `"0"` for a zero-dimensional (scalar) array (§4.3 "Scalar dataset").
    #[must_use]
    pub fn chunk_key(&self, chunk_index: &[u64]) -> String {
        if chunk_index.is_empty() {
            "0".to_string()
        } else {
            chunk_index
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(&self.dimension_separator.to_string())
        }
    }
}

/// One `(field_name, dtype)` entry of a `_COMPOUND_DTYPE` attribute (§3).
pub type CompoundField = (String, String);

/// `_SOFT_LINK` attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SoftLinkAttr {
    /// The path of the linked-to group, relative to the store root.
    pub path: String,
}

/// `_REFERENCE` attribute value: an HDF5 object reference (§3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceAttr {
    /// Always `"."`: the reference is relative to the enclosing store.
    pub source: String,
    /// Path of the referenced object.
    pub path: String,
    /// Object id of the referenced object, as recorded at translation time.
    pub object_id: String,
    /// Object id the translator observed the reference's source object to
    /// have; used as the §9 consistency cross-check.
    pub source_object_id: String,
}

/// `_EXTERNAL_ARRAY_LINK` attribute value (§3, §4.3 chunk-count fallback).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalArrayLinkAttr {
    /// Always `"hdf5_dataset"`.
    pub link_type: String,
    /// URL of the external HDF5 file.
    pub url: String,
    /// Dataset path/name within the external HDF5 file.
    pub name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_key_joins_with_dot() {
        let meta = ArrayMetadataV2::new(vec![10, 20], vec![5, 5], "<f4");
        assert_eq!(meta.chunk_key(&[1, 3]), "1.3");
        assert_eq!(meta.chunk_key(&[]), "0");
    }

    #[test]
    fn metadata_v2_round_trips_with_extra_fields() {
        let text = r#"{"id":"blosc","cname":"lz4","clevel":5}"#;
        let meta: MetadataV2 = serde_json::from_str(text).unwrap();
        assert_eq!(meta.id(), "blosc");
        assert_eq!(meta.configuration().get("clevel").unwrap(), 5);
        let round_tripped = serde_json::to_string(&meta).unwrap();
        let reparsed: MetadataV2 = serde_json::from_str(&round_tripped).unwrap();
        assert_eq!(reparsed, meta);
    }
}
