//! E6 (scalar dataset) and hierarchy-layer behavior over a plain RFS.

use lindi::hierarchy::{list_chunk_keys, read_zattrs, resolve_soft_link_one_hop};
use lindi::key::StoreKey;
use lindi::rfs::Rfs;
use lindi::store::Backing;
use lindi::ReferenceStore;

fn store_with(refs: &[(&str, &str)]) -> ReferenceStore {
    let mut rfs = Rfs::new();
    for (k, v) in refs {
        rfs.set_inline(*k, *v);
    }
    ReferenceStore::new(rfs, Backing::Json, true, None)
}

#[test]
fn e6_scalar_dataset_carries_scalar_attr_and_chunk_value() {
    let store = store_with(&[
        (
            "s/.zarray",
            r#"{"zarr_format":2,"shape":[1],"chunks":[1],"dtype":"<f8","compressor":null,"fill_value":0.0,"order":"C","filters":null,"dimension_separator":"."}"#,
        ),
        ("s/.zattrs", r#"{"_SCALAR":true}"#),
        ("s/0", "3.5"),
    ]);

    let attrs = read_zattrs(&store, "s").unwrap();
    assert!(attrs.scalar);
    assert_eq!(store.get(&StoreKey::new("s/0").unwrap()).unwrap(), b"3.5");
}

#[test]
fn soft_link_resolves_one_hop_and_does_not_chase_cycles() {
    let store = store_with(&[
        ("a/.zattrs", r#"{"_SOFT_LINK":{"path":"b"}}"#),
        ("b/.zattrs", r#"{"_SOFT_LINK":{"path":"a"}}"#),
    ]);
    assert_eq!(resolve_soft_link_one_hop(&store, "a").unwrap(), Some("b".to_string()));
    // A second, explicit hop from the caller reaches "a" again; the layer
    // itself never loops internally (§9 cyclic soft links).
    assert_eq!(resolve_soft_link_one_hop(&store, "b").unwrap(), Some("a".to_string()));
}

#[test]
fn lists_chunk_keys_in_lexicographic_order() {
    let store = store_with(&[
        ("g/d/.zarray", "{}"),
        ("g/d/.zattrs", "{}"),
        ("g/d/10.0", "x"),
        ("g/d/2.0", "y"),
    ]);
    let chunks = list_chunk_keys(&store, "g/d");
    assert_eq!(chunks, vec!["g/d/10.0".to_string(), "g/d/2.0".to_string()]);
}
