//! The reference file system (RFS) document (§3).
//!
//! An RFS is the JSON document `{"version": N, "refs": {...}}` mapping Zarr
//! store keys to one of three shapes: an inline UTF-8 string, a one-element
//! `[base64]` array, or a three-element `[url, offset, size]` array.

use std::collections::BTreeMap;

use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::RefsError;
use crate::key::StoreKey;

/// The reserved URL marking a reference as pointing inside the enclosing
/// LINDI container rather than at an external resource (§3, §4.6).
pub const SELF_REFERENCE_URL: &str = "./";

/// The current RFS schema version this crate reads and writes.
pub const RFS_VERSION: u64 = 1;

/// A single `refs` entry.
#[derive(Debug, Clone, PartialEq)]
pub enum Ref {
    /// A small inline UTF-8 value (typically `.zarray`/`.zgroup`/`.zattrs` JSON text).
    Inline(String),
    /// A small inline binary value, stored as base64 in the document.
    InlineBase64(String),
    /// A byte range `[url, offset, size]`. `url` is `"./"`-prefixed (or empty)
    /// for a self-referential range into the enclosing container.
    External {
        /// The URL the range is read from, or [`SELF_REFERENCE_URL`] / `""` for self-references.
        url: String,
        /// The byte offset of the range.
        offset: u64,
        /// The byte size of the range.
        size: u64,
    },
}

impl Ref {
    /// True if this is an external reference whose URL marks it self-referential (§3, §4.6).
    #[must_use]
    pub fn is_self_referential(&self) -> bool {
        matches!(self, Ref::External { url, .. } if url.is_empty() || url.starts_with(SELF_REFERENCE_URL))
    }

    fn validate(&self, key: &str) -> Result<(), RefsError> {
        if let Ref::External { offset: _, size, .. } = self {
            if *size == 0 {
                return Err(RefsError::InvalidByteRange(key.to_string(), self.offset_or_zero(), *size));
            }
        }
        Ok(())
    }

    fn offset_or_zero(&self) -> u64 {
        match self {
            Ref::External { offset, .. } => *offset,
            _ => 0,
        }
    }

    /// Parse one `refs` entry's JSON value under `key` into its shape (§3).
    ///
    /// # Errors
    /// Returns [`RefsError::InvalidRefShape`] if `value` is not a string, a
    /// one-element array, or a three-element array of the expected types, or
    /// [`RefsError::InvalidBase64`] if a one-element array's payload is not
    /// valid base64.
    fn from_value(key: &str, value: Value) -> Result<Self, RefsError> {
        match value {
            Value::String(s) => Ok(Ref::Inline(s)),
            Value::Array(arr) if arr.len() == 1 => {
                let b64 = arr[0]
                    .as_str()
                    .ok_or_else(|| RefsError::InvalidRefShape(key.to_string()))?;
                use base64::Engine;
                base64::engine::general_purpose::STANDARD
                    .decode(b64)
                    .map_err(|e| RefsError::InvalidBase64(key.to_string(), e))?;
                Ok(Ref::InlineBase64(b64.to_string()))
            }
            Value::Array(arr) if arr.len() == 3 => {
                let url = arr[0]
                    .as_str()
                    .ok_or_else(|| RefsError::InvalidRefShape(key.to_string()))?
                    .to_string();
                let offset = arr[1]
                    .as_u64()
                    .ok_or_else(|| RefsError::InvalidRefShape(key.to_string()))?;
                let size = arr[2]
                    .as_u64()
                    .ok_or_else(|| RefsError::InvalidRefShape(key.to_string()))?;
                Ok(Ref::External { url, offset, size })
            }
            _ => Err(RefsError::InvalidRefShape(key.to_string())),
        }
    }
}

impl Serialize for Ref {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Ref::Inline(s) => serializer.serialize_str(s),
            Ref::InlineBase64(b64) => [b64].serialize(serializer),
            Ref::External { url, offset, size } => (url, offset, size).serialize(serializer),
        }
    }
}

/// The reference file system document (§3).
#[derive(Debug, Clone, Serialize)]
pub struct Rfs {
    /// Schema version.
    pub version: u64,
    /// Zarr store key to reference mapping. A `BTreeMap` so that
    /// serialization always emits keys in lexicographic order (§9).
    pub refs: BTreeMap<String, Ref>,
}

impl Rfs {
    /// An empty RFS at the current schema version.
    #[must_use]
    pub fn new() -> Self {
        Self {
            version: RFS_VERSION,
            refs: BTreeMap::new(),
        }
    }

    /// Parse an RFS from its JSON text, validating every entry (§3 invariants).
    ///
    /// # Errors
    /// Returns [`RefsError`] if the document is not valid JSON, a key is not
    /// a valid store key, or a reference's shape, base64, or `offset`/`size`
    /// is malformed.
    pub fn parse(text: &str) -> Result<Self, RefsError> {
        #[derive(Deserialize)]
        struct RawRfs {
            version: u64,
            refs: BTreeMap<String, Value>,
        }
        let raw: RawRfs = serde_json::from_str(text)?;
        let mut refs = BTreeMap::new();
        for (key, value) in raw.refs {
            StoreKey::new(key.as_str()).map_err(RefsError::InvalidKey)?;
            let r = Ref::from_value(&key, value)?;
            r.validate(&key)?;
            refs.insert(key, r);
        }
        Ok(Self { version: raw.version, refs })
    }

    /// Validate every `refs` entry against the §3 invariants.
    ///
    /// # Errors
    /// Returns [`RefsError`] on the first invalid key or reference found.
    pub fn validate(&self) -> Result<(), RefsError> {
        for (key, r) in &self.refs {
            StoreKey::new(key.as_str()).map_err(RefsError::InvalidKey)?;
            r.validate(key)?;
        }
        Ok(())
    }

    /// Serialize to pretty JSON text with keys in lexicographic order.
    ///
    /// # Errors
    /// Returns [`RefsError`] if serialization fails (infallible in practice).
    pub fn to_json(&self) -> Result<String, RefsError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Insert an inline UTF-8 ref.
    pub fn set_inline(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.refs.insert(key.into(), Ref::Inline(value.into()));
    }

    /// Insert an inline base64 ref, encoding `bytes`.
    pub fn set_inline_bytes(&mut self, key: impl Into<String>, bytes: &[u8]) {
        use base64::Engine;
        let b64 = base64::engine::general_purpose::STANDARD.encode(bytes);
        self.refs.insert(key.into(), Ref::InlineBase64(b64));
    }

    /// Insert an external byte-range ref.
    pub fn set_external(&mut self, key: impl Into<String>, url: impl Into<String>, offset: u64, size: u64) {
        self.refs.insert(
            key.into(),
            Ref::External {
                url: url.into(),
                offset,
                size,
            },
        );
    }

    /// Insert a self-referential byte-range ref (§3, §4.6).
    pub fn set_self_referential(&mut self, key: impl Into<String>, offset: u64, size: u64) {
        self.set_external(key, SELF_REFERENCE_URL, offset, size);
    }
}

impl Default for Rfs {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_all_shapes() {
        let mut rfs = Rfs::new();
        rfs.set_inline("g/.zattrs", r#"{"a":7}"#);
        rfs.set_inline_bytes("g/d/0", &[0u8; 4]);
        rfs.set_external("g/d/1", "https://example.com/f.h5", 10, 20);
        rfs.set_self_referential("g/d/2", 100, 50);

        let text = rfs.to_json().unwrap();
        let parsed = Rfs::parse(&text).unwrap();

        assert_eq!(parsed.refs.get("g/.zattrs"), Some(&Ref::Inline(r#"{"a":7}"#.to_string())));
        assert!(matches!(parsed.refs.get("g/d/0"), Some(Ref::InlineBase64(_))));
        assert!(matches!(
            parsed.refs.get("g/d/1"),
            Some(Ref::External { offset: 10, size: 20, .. })
        ));
        assert!(parsed.refs.get("g/d/2").unwrap().is_self_referential());
    }

    #[test]
    fn keys_serialize_lexicographically() {
        let mut rfs = Rfs::new();
        rfs.set_inline("z", "1");
        rfs.set_inline("a", "2");
        rfs.set_inline("m", "3");
        let text = rfs.to_json().unwrap();
        let pos_a = text.find("\"a\"").unwrap();
        let pos_m = text.find("\"m\"").unwrap();
        let pos_z = text.find("\"z\"").unwrap();
        assert!(pos_a < pos_m);
        assert!(pos_m < pos_z);
    }

    #[test]
    fn rejects_invalid_key() {
        let text = r#"{"version":1,"refs":{"/bad":"x"}}"#;
        assert!(Rfs::parse(text).is_err());
    }

    #[test]
    fn rejects_zero_size_external_ref() {
        let text = r#"{"version":1,"refs":{"k":["./",0,0]}}"#;
        assert!(Rfs::parse(text).is_err());
    }
}
