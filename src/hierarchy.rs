//! The thin Zarr hierarchy layer LINDI extends (§4, §B): read helpers over a
//! [`ReferenceStore`] that are aware of the `.zattrs` extension attributes,
//! plus chunk-index enumeration for a `.zarray`. The full array
//! read/write/codec-chain/chunk-grid machinery is standard Zarr v2 and out
//! of scope here (§2).

use serde_json::{Map, Value};

use crate::key::{StoreKey, StorePrefix};
use crate::metadata::{ArrayMetadataV2, ExternalArrayLinkAttr, GroupMetadataV2, SoftLinkAttr};
use crate::store::ReferenceStore;
use crate::StoreError;

/// `_SCALAR`, `_SOFT_LINK`, `_REFERENCE`, `_COMPOUND_DTYPE`, and
/// `_EXTERNAL_ARRAY_LINK` as recognized on a node's `.zattrs` (§3).
#[derive(Debug, Clone, Default)]
pub struct LindiAttrs {
    /// `_SCALAR = true`.
    pub scalar: bool,
    /// `_SOFT_LINK = {path}`.
    pub soft_link: Option<SoftLinkAttr>,
    /// `_COMPOUND_DTYPE = [[field, dtype], ...]`.
    pub compound_dtype: Option<Vec<(String, String)>>,
    /// `_EXTERNAL_ARRAY_LINK = {link_type, url, name}`.
    pub external_array_link: Option<ExternalArrayLinkAttr>,
    /// Every other attribute, unmodified.
    pub user_attributes: Map<String, Value>,
}

fn zattrs_key(group: &str) -> String {
    if group.is_empty() {
        ".zattrs".to_string()
    } else {
        format!("{group}/.zattrs")
    }
}

fn zgroup_key(group: &str) -> String {
    if group.is_empty() {
        ".zgroup".to_string()
    } else {
        format!("{group}/.zgroup")
    }
}

fn zarray_key(array: &str) -> String {
    format!("{array}/.zarray")
}

/// Read and parse `<group>/.zattrs`, splitting out the LINDI extension
/// attributes from ordinary user attributes.
///
/// # Errors
/// Returns [`StoreError`] if the key is missing or the JSON fails to parse.
pub fn read_zattrs(store: &ReferenceStore, group: &str) -> Result<LindiAttrs, StoreError> {
    let bytes = store.get(&StoreKey::new(zattrs_key(group)).unwrap())?;
    let mut map: Map<String, Value> = serde_json::from_slice(&bytes).map_err(|_| StoreError::CorruptReference {
        key: zattrs_key(group),
        declared: 0,
        actual: 0,
    })?;

    let scalar = map
        .remove("_SCALAR")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    let soft_link = map
        .remove("_SOFT_LINK")
        .and_then(|v| serde_json::from_value(v).ok());
    let compound_dtype = map.remove("_COMPOUND_DTYPE").and_then(|v| {
        v.as_array().map(|rows| {
            rows.iter()
                .filter_map(|row| {
                    let row = row.as_array()?;
                    Some((row.first()?.as_str()?.to_string(), row.get(1)?.as_str()?.to_string()))
                })
                .collect()
        })
    });
    let external_array_link = map
        .remove("_EXTERNAL_ARRAY_LINK")
        .and_then(|v| serde_json::from_value(v).ok());
    // `_REFERENCE` is not a group-level .zattrs key in its own right; it
    // appears nested inside ordinary attribute values or compound rows, so
    // it is left untouched in `user_attributes` for the caller to inspect.

    Ok(LindiAttrs {
        scalar,
        soft_link,
        compound_dtype,
        external_array_link,
        user_attributes: map,
    })
}

/// Read and parse `<group>/.zgroup`.
///
/// # Errors
/// Returns [`StoreError`] if the key is missing or the JSON fails to parse.
pub fn read_zgroup(store: &ReferenceStore, group: &str) -> Result<GroupMetadataV2, StoreError> {
    let bytes = store.get(&StoreKey::new(zgroup_key(group)).unwrap())?;
    serde_json::from_slice(&bytes).map_err(|_| StoreError::CorruptReference {
        key: zgroup_key(group),
        declared: 0,
        actual: 0,
    })
}

/// Read and parse `<array>/.zarray`.
///
/// # Errors
/// Returns [`StoreError`] if the key is missing or the JSON fails to parse.
pub fn read_zarray(store: &ReferenceStore, array: &str) -> Result<ArrayMetadataV2, StoreError> {
    let bytes = store.get(&StoreKey::new(zarray_key(array)).unwrap())?;
    serde_json::from_slice(&bytes).map_err(|_| StoreError::CorruptReference {
        key: zarray_key(array),
        declared: 0,
        actual: 0,
    })
}

/// Resolve a `_SOFT_LINK` one hop: if `group`'s attrs carry `_SOFT_LINK`,
/// return the path it points to. Callers must not call this again on the
/// result without an explicit loop check — soft links may form cycles and
/// this layer must not recursively dereference them during enumeration (§9).
///
/// # Errors
/// Returns [`StoreError`] if `group`'s `.zattrs` cannot be read.
pub fn resolve_soft_link_one_hop(store: &ReferenceStore, group: &str) -> Result<Option<String>, StoreError> {
    Ok(read_zattrs(store, group)?.soft_link.map(|link| link.path))
}

/// Enumerate the chunk keys present under `<array>/` (i.e. everything other
/// than `.zarray`/`.zattrs`), in lexicographic order.
#[must_use]
pub fn list_chunk_keys(store: &ReferenceStore, array: &str) -> Vec<String> {
    let prefix = if array.is_empty() {
        StorePrefix::root()
    } else {
        StorePrefix::new(format!("{array}/")).unwrap()
    };
    store
        .list_dir(&prefix)
        .keys
        .into_iter()
        .filter(|k| !k.ends_with(".zarray") && !k.ends_with(".zattrs") && !k.ends_with(".zgroup"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rfs::Rfs;
    use crate::store::Backing;

    fn store_with(refs: &[(&str, &str)]) -> ReferenceStore {
        let mut rfs = Rfs::new();
        for (k, v) in refs {
            rfs.set_inline(*k, *v);
        }
        ReferenceStore::new(rfs, Backing::Json, true, None)
    }

    #[test]
    fn splits_lindi_extension_attrs_from_user_attrs() {
        let store = store_with(&[(
            "g/.zattrs",
            r#"{"_SCALAR":true,"a":7,"_SOFT_LINK":{"path":"g2"}}"#,
        )]);
        let attrs = read_zattrs(&store, "g").unwrap();
        assert!(attrs.scalar);
        assert_eq!(attrs.soft_link.unwrap().path, "g2");
        assert_eq!(attrs.user_attributes.get("a").unwrap(), 7);
    }

    #[test]
    fn resolves_soft_link_one_hop_only() {
        let store = store_with(&[("g/.zattrs", r#"{"_SOFT_LINK":{"path":"g2"}}"#)]);
        assert_eq!(resolve_soft_link_one_hop(&store, "g").unwrap(), Some("g2".to_string()));
    }

    #[test]
    fn lists_chunk_keys_excluding_metadata() {
        let store = store_with(&[
            ("g/d/.zarray", "{}"),
            ("g/d/.zattrs", "{}"),
            ("g/d/0.0", "x"),
            ("g/d/0.1", "y"),
        ]);
        let chunks = list_chunk_keys(&store, "g/d");
        assert_eq!(chunks, vec!["g/d/0.0".to_string(), "g/d/0.1".to_string()]);
    }
}
