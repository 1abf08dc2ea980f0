//! The HDF5 → Zarr translator (§4.3).
//!
//! Walks an HDF5 file depth-first, children sorted lexicographically (§4.3
//! "Determinism"), and emits an [`Rfs`] whose chunk references point at the
//! original file's byte ranges. The HDF5 reader itself (`hdf5-metno`) is the
//! external collaborator named in §6; this module only translates what it
//! reports.

#![cfg(feature = "hdf5")]

use hdf5_metno::types::TypeDescriptor;
use hdf5_metno::{Dataset, File, Group};
use serde_json::{json, Map, Value};

pub use crate::error::Hdf5Error;
use crate::codec::Codec;
use crate::config::global_config;
use crate::metadata::{ArrayMetadataV2, ExternalArrayLinkAttr, GroupMetadataV2, ReferenceAttr};
use crate::rfs::Rfs;

fn join(path: &str, name: &str) -> String {
    if path.is_empty() {
        name.to_string()
    } else {
        format!("{path}/{name}")
    }
}

/// Translate the HDF5 file at `path_or_url` into an [`Rfs`] whose chunk
/// references point back at the original file (§4.3).
///
/// # Errors
/// Returns [`Hdf5Error`] if the file cannot be opened by `hdf5-metno`.
pub fn translate_hdf5(path_or_url: &str) -> Result<Rfs, Hdf5Error> {
    let file = File::open(path_or_url)?;
    let mut rfs = Rfs::new();
    translate_group(&file, "", path_or_url, &mut rfs)?;
    Ok(rfs)
}

fn translate_group(group: &Group, path: &str, source_url: &str, rfs: &mut Rfs) -> Result<(), Hdf5Error> {
    let zgroup_key = if path.is_empty() {
        ".zgroup".to_string()
    } else {
        format!("{path}/.zgroup")
    };
    rfs.set_inline(zgroup_key, serde_json::to_string(&GroupMetadataV2::default())?);

    let attrs = translate_attributes(group, path)?;
    let zattrs_key = if path.is_empty() {
        ".zattrs".to_string()
    } else {
        format!("{path}/.zattrs")
    };
    rfs.set_inline(zattrs_key, serde_json::to_string(&Value::Object(attrs))?);

    let mut names = group
        .member_names()
        .map_err(|e| Hdf5Error::Unsupported(format!("listing members of {path:?}: {e}")))?;
    names.sort();

    for name in names {
        let child_path = join(path, &name);

        if let Some(target) = soft_link_target(group, &name) {
            translate_soft_link(&child_path, &target, rfs)?;
            continue;
        }

        if let Ok(subgroup) = group.group(&name) {
            translate_group(&subgroup, &child_path, source_url, rfs)?;
        } else if let Ok(dataset) = group.dataset(&name) {
            translate_dataset(&dataset, &child_path, source_url, rfs)?;
        } else {
            log::warn!("skipping unsupported member {child_path}: neither a group nor a dataset");
        }
    }
    Ok(())
}

/// A soft link is empty group with a `_SOFT_LINK` attribute (§4.3 "Soft
/// link"); external links are unsupported and elided with a warning.
fn soft_link_target(group: &Group, name: &str) -> Option<String> {
    match group.link_type(name) {
        Ok(hdf5_metno::LinkType::Soft) => group.link_value(name).ok(),
        Ok(hdf5_metno::LinkType::External) => {
            log::warn!("external link {name} is not supported, skipping");
            None
        }
        _ => None,
    }
}

fn translate_soft_link(path: &str, target: &str, rfs: &mut Rfs) -> Result<(), Hdf5Error> {
    rfs.set_inline(format!("{path}/.zgroup"), serde_json::to_string(&GroupMetadataV2::default())?);
    let attrs = json!({ "_SOFT_LINK": { "path": target } });
    rfs.set_inline(format!("{path}/.zattrs"), serde_json::to_string(&attrs)?);
    Ok(())
}

fn translate_attributes(group: &Group, path: &str) -> Result<Map<String, Value>, Hdf5Error> {
    let mut out = Map::new();
    for name in group.attr_names().unwrap_or_default() {
        match group.attr(&name).and_then(|a| attribute_to_json(&a, path, &name)) {
            Ok(value) => {
                out.insert(name, value);
            }
            Err(err) => log::warn!("skipping unsupported attribute {path}/{name}: {err}"),
        }
    }
    Ok(out)
}

fn attribute_to_json(attr: &hdf5_metno::Attribute, object_path: &str, attr_name: &str) -> Result<Value, Hdf5Error> {
    if let Ok(r) = attr.read_scalar::<hdf5_metno::types::Reference>() {
        return Ok(object_reference_to_json(object_path, attr_name, &r));
    }
    if let Ok(v) = attr.read_scalar::<f64>() {
        return Ok(json!(v));
    }
    if let Ok(v) = attr.read_scalar::<i64>() {
        return Ok(json!(v));
    }
    if let Ok(v) = attr.read_scalar::<String>() {
        return Ok(json!(v));
    }
    if let Ok(v) = attr.read_1d::<f64>() {
        return Ok(json!(v.to_vec()));
    }
    if let Ok(v) = attr.read_1d::<String>() {
        return Ok(json!(v.to_vec()));
    }
    Err(Hdf5Error::Unsupported(format!(
        "attribute {object_path}/{attr_name} has an unsupported dtype"
    )))
}

fn object_reference_to_json(object_path: &str, attr_name: &str, reference: &hdf5_metno::types::Reference) -> Value {
    let object_id = format!("{object_path}#{attr_name}");
    let resolved_path = reference.name().unwrap_or_default();
    json!({
        "_REFERENCE": ReferenceAttr {
            source: ".".to_string(),
            path: resolved_path,
            object_id: object_id.clone(),
            source_object_id: object_id,
        }
    })
}

fn translate_dataset(dataset: &Dataset, path: &str, source_url: &str, rfs: &mut Rfs) -> Result<(), Hdf5Error> {
    let shape = dataset.shape();
    let is_scalar = shape.is_empty();
    let type_descriptor = dataset
        .dtype()
        .map_err(|e| Hdf5Error::Unsupported(format!("reading dtype of {path}: {e}")))?
        .to_descriptor()
        .map_err(|e| Hdf5Error::Unsupported(format!("describing dtype of {path}: {e}")))?;

    if let TypeDescriptor::Compound(compound) = &type_descriptor {
        return translate_compound_dataset(dataset, path, compound, rfs);
    }

    let zarr_dtype = zarr_dtype_string(&type_descriptor);
    let chunks = if is_scalar {
        vec![1]
    } else {
        dataset.chunks().unwrap_or_else(|| shape.iter().map(|&d| d as u64).collect())
    };
    let shape_u64: Vec<u64> = if is_scalar {
        vec![1]
    } else {
        shape.iter().map(|&d| d as u64).collect()
    };

    let mut meta = ArrayMetadataV2::new(shape_u64.clone(), chunks.clone(), zarr_dtype);
    let (compressor, filters, has_unsupported_filter) = translate_filters(dataset, path);
    meta.compressor = compressor;
    meta.filters = filters;

    rfs.set_inline(format!("{path}/.zarray"), serde_json::to_string(&meta)?);

    let mut zattrs: Map<String, Value> = Map::new();
    if is_scalar {
        zattrs.insert("_SCALAR".to_string(), Value::Bool(true));
    }

    let num_chunks_total: usize = if is_scalar {
        1
    } else {
        dataset.num_chunks().unwrap_or(1)
    };

    if !is_scalar
        && (num_chunks_total > global_config().external_array_link_chunk_threshold || has_unsupported_filter)
    {
        zattrs.insert(
            "_EXTERNAL_ARRAY_LINK".to_string(),
            serde_json::to_value(ExternalArrayLinkAttr {
                link_type: "hdf5_dataset".to_string(),
                url: source_url.to_string(),
                name: format!("/{path}"),
            })?,
        );
        rfs.set_inline(format!("{path}/.zattrs"), serde_json::to_string(&zattrs)?);
        return Ok(());
    }

    rfs.set_inline(format!("{path}/.zattrs"), serde_json::to_string(&zattrs)?);

    if is_scalar {
        if let Some((offset, size)) = dataset.offset().map(|o| (o, dataset.storage_size())) {
            rfs.set_external(format!("{path}/0"), source_url, offset, size);
        } else {
            log::warn!("scalar dataset {path} has no contiguous storage, skipping chunk ref");
        }
        return Ok(());
    }

    match dataset.num_chunks() {
        None => {
            // Contiguous dataset: one reference spans the whole array (§4.3).
            if let Some(offset) = dataset.offset() {
                let key = meta.chunk_key(&vec![0; shape_u64.len()]);
                rfs.set_external(format!("{path}/{key}"), source_url, offset, dataset.storage_size());
            } else {
                log::warn!("dataset {path} has no contiguous storage and reports no chunks; skipping");
            }
        }
        Some(n) => {
            for i in 0..n {
                let Some(info) = dataset.chunk_info(i) else {
                    log::warn!("dataset {path} chunk {i} has no byte-range info, skipping");
                    continue;
                };
                let key = meta.chunk_key(&info.index.iter().map(|&x| x as u64).collect::<Vec<_>>());
                rfs.set_external(format!("{path}/{key}"), source_url, info.offset, info.size);
            }
        }
    }
    Ok(())
}

fn translate_compound_dataset(
    dataset: &Dataset,
    path: &str,
    compound: &hdf5_metno::types::CompoundType,
    rfs: &mut Rfs,
) -> Result<(), Hdf5Error> {
    let fields: Vec<(String, String)> = compound
        .fields
        .iter()
        .map(|f| (f.name.clone(), zarr_dtype_string(&f.ty)))
        .collect();

    let shape = dataset.shape();
    let shape_u64: Vec<u64> = shape.iter().map(|&d| d as u64).collect();
    let chunks = dataset.chunks().unwrap_or_else(|| shape_u64.clone());
    let mut meta = ArrayMetadataV2::new(shape_u64.clone(), chunks, "|O");
    meta.compressor = None;
    meta.filters = None;
    rfs.set_inline(format!("{path}/.zarray"), serde_json::to_string(&meta)?);

    let mut zattrs = Map::new();
    zattrs.insert(
        "_COMPOUND_DTYPE".to_string(),
        serde_json::to_value(&fields)?,
    );
    rfs.set_inline(format!("{path}/.zattrs"), serde_json::to_string(&zattrs)?);

    // Compound rows are re-encoded as JSON, unlike plain arrays whose raw
    // HDF5 bytes are referenced as-is: the Zarr codec pipeline cannot decode
    // a packed HDF5 C struct directly. The whole dataset is read now (not
    // lazily) so its rows can be encoded once per chunk.
    let raw = dataset
        .read_raw::<u8>()
        .map_err(|e| Hdf5Error::Unsupported(format!("reading compound dataset {path}: {e}")))?;
    let row_size = compound.size;
    let rows_per_chunk: usize = meta.chunks.iter().product::<u64>() as usize;
    let total_rows = shape_u64.iter().product::<u64>().max(1) as usize;

    for chunk_start in (0..total_rows).step_by(rows_per_chunk.max(1)) {
        let chunk_end = (chunk_start + rows_per_chunk).min(total_rows);
        let mut rows_json = Vec::with_capacity(chunk_end - chunk_start);
        for row in chunk_start..chunk_end {
            let row_bytes = &raw[row * row_size..(row + 1) * row_size];
            rows_json.push(decode_compound_row(row_bytes, compound));
        }
        let key = meta.chunk_key(&[(chunk_start / rows_per_chunk.max(1)) as u64]);
        let encoded = serde_json::to_vec(&rows_json)?;
        rfs.set_inline_bytes(format!("{path}/{key}"), &encoded);
    }
    Ok(())
}

fn decode_compound_row(bytes: &[u8], compound: &hdf5_metno::types::CompoundType) -> Value {
    let mut row = Map::new();
    for field in &compound.fields {
        let field_bytes = &bytes[field.offset..field.offset + field.ty.size()];
        let value = match &field.ty {
            TypeDescriptor::Integer(_) | TypeDescriptor::Unsigned(_) => {
                decode_little_endian_integer(field_bytes)
            }
            TypeDescriptor::Float(hdf5_metno::types::FloatSize::U4) => {
                json!(f32::from_le_bytes(field_bytes.try_into().unwrap_or_default()))
            }
            TypeDescriptor::Float(_) => {
                json!(f64::from_le_bytes(field_bytes.try_into().unwrap_or_default()))
            }
            TypeDescriptor::FixedAscii(_) | TypeDescriptor::FixedUnicode(_) => {
                let end = field_bytes.iter().position(|&b| b == 0).unwrap_or(field_bytes.len());
                json!(String::from_utf8_lossy(&field_bytes[..end]).into_owned())
            }
            _ => {
                use base64::Engine;
                json!(base64::engine::general_purpose::STANDARD.encode(field_bytes))
            }
        };
        row.insert(field.name.clone(), value);
    }
    Value::Object(row)
}

fn decode_little_endian_integer(bytes: &[u8]) -> Value {
    let mut buf = [0u8; 8];
    buf[..bytes.len().min(8)].copy_from_slice(&bytes[..bytes.len().min(8)]);
    json!(i64::from_le_bytes(buf))
}

/// Map a dataset's HDF5 filter pipeline to Zarr `compressor`/`filters` metadata.
///
/// The third element of the returned tuple is `true` if any filter in the
/// pipeline had no Zarr codec equivalent; callers must treat that the same
/// as the chunk-count threshold and fall back to `_EXTERNAL_ARRAY_LINK`,
/// since the chunk bytes on disk cannot be decoded without that filter.
fn translate_filters(
    dataset: &Dataset,
    path: &str,
) -> (Option<crate::metadata::MetadataV2>, Option<Vec<crate::metadata::MetadataV2>>, bool) {
    let Ok(filters) = dataset.filters() else {
        return (None, None, false);
    };
    let mut filter_entries = Vec::new();
    let mut has_unsupported_filter = false;
    for filter_name in filters.names() {
        let element_size = dataset.dtype().map(|d| d.size()).unwrap_or(4);
        match Codec::from_hdf5_filter_name(&filter_name, element_size) {
            Some(codec) => filter_entries.push(crate::metadata::MetadataV2 {
                id: codec.zarr_id().to_string(),
                configuration: Map::new(),
            }),
            None => {
                log::warn!("dataset {path} uses unsupported filter {filter_name}");
                has_unsupported_filter = true;
            }
        }
    }
    if filter_entries.is_empty() {
        (None, None, has_unsupported_filter)
    } else {
        let compressor = filter_entries.pop();
        (
            compressor,
            if filter_entries.is_empty() { None } else { Some(filter_entries) },
            has_unsupported_filter,
        )
    }
}

fn zarr_dtype_string(descriptor: &TypeDescriptor) -> String {
    match descriptor {
        TypeDescriptor::Integer(size) => format!("<i{}", size.size()),
        TypeDescriptor::Unsigned(size) => format!("<u{}", size.size()),
        TypeDescriptor::Float(size) => format!("<f{}", size.size()),
        TypeDescriptor::Boolean => "|b1".to_string(),
        TypeDescriptor::FixedAscii(n) | TypeDescriptor::FixedUnicode(n) => format!("|S{n}"),
        _ => "|O".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zarr_dtype_mapping() {
        assert_eq!(
            zarr_dtype_string(&TypeDescriptor::Float(hdf5_metno::types::FloatSize::U4)),
            "<f4"
        );
    }
}
