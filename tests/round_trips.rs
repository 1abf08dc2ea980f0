//! End-to-end scenarios E1, E3, E4, E5 and the round-trip/equivalence laws.

use lindi::container::{open_lindi, open_lindi_read_write, write_lindi, ContainerFormat};
use lindi::key::StoreKey;
use lindi::rfs::Rfs;

fn key(s: &str) -> StoreKey {
    StoreKey::new(s).unwrap()
}

#[test]
fn e1_plain_json_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("t.lindi.json");

    let mut rfs = Rfs::new();
    rfs.set_inline("g/.zgroup", r#"{"zarr_format":2}"#);
    rfs.set_inline("g/.zattrs", r#"{"a":7}"#);
    rfs.set_inline(
        "g/d/.zarray",
        r#"{"zarr_format":2,"shape":[10],"chunks":[10],"dtype":"<f4","compressor":null,"fill_value":0.0,"order":"C","filters":null,"dimension_separator":"."}"#,
    );
    rfs.set_inline_bytes("g/d/0", &[0u8; 40]);
    write_lindi(rfs, &path, ContainerFormat::Json).unwrap();

    let store = open_lindi(&path).unwrap();
    let attrs: serde_json::Value = serde_json::from_slice(&store.get(&key("g/.zattrs")).unwrap()).unwrap();
    assert_eq!(attrs["a"], 7);
    assert_eq!(store.get(&key("g/d/0")).unwrap(), vec![0u8; 40]);
}

#[test]
fn round_trip_law_holds_for_tar_format() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("t.lindi.tar");

    let mut rfs = Rfs::new();
    rfs.set_inline("g/.zattrs", r#"{"a":1}"#);
    write_lindi(rfs.clone(), &path, ContainerFormat::Tar).unwrap();

    let reloaded = open_lindi(&path).unwrap().to_rfs();
    assert_eq!(reloaded.refs.get("g/.zattrs"), rfs.refs.get("g/.zattrs"));
}

#[test]
fn equivalence_across_json_and_tar_formats() {
    let dir = tempfile::tempdir().unwrap();
    let json_path = dir.path().join("a.lindi.json");
    let tar_path = dir.path().join("a.lindi.tar");

    let mut rfs = Rfs::new();
    rfs.set_inline("g/.zattrs", r#"{"a":1}"#);
    rfs.set_inline_bytes("g/d/0", &[9, 9, 9]);

    write_lindi(rfs.clone(), &json_path, ContainerFormat::Json).unwrap();
    write_lindi(rfs, &tar_path, ContainerFormat::Tar).unwrap();

    let json_store = open_lindi(&json_path).unwrap();
    let tar_store = open_lindi(&tar_path).unwrap();
    assert_eq!(
        json_store.get(&key("g/d/0")).unwrap(),
        tar_store.get(&key("g/d/0")).unwrap()
    );
}

#[test]
fn e3_in_place_grow_preserves_other_offsets_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("t.lindi.tar");

    let mut rfs = Rfs::new();
    rfs.set_inline("g/.zattrs", r#"{"a":1}"#);
    rfs.set_inline_bytes("g/d/0", &[1, 2, 3, 4]);
    write_lindi(rfs, &path, ContainerFormat::Tar).unwrap();

    let mut container = lindi::tar::TarContainer::open(&path).unwrap();
    let chunk_offset_before = container.index().members["g/d/0"].header_offset;
    let grown = serde_json::to_vec(&serde_json::json!({"version": 1, "refs": {"a": "longer value now"}})).unwrap();
    container.grow_member("lindi.json", &grown).unwrap();
    drop(container);

    let source = lindi::tar::LocalFileSource::open(&path).unwrap();
    let (_entry, index) = lindi::tar::open_container(&source).unwrap();
    assert_eq!(index.members["g/d/0"].header_offset, chunk_offset_before);
}

#[test]
fn e4_overflow_tombstones_old_member_and_reopens() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("t.lindi.tar");
    write_lindi(Rfs::new(), &path, ContainerFormat::Tar).unwrap();

    let mut container = lindi::tar::TarContainer::open(&path).unwrap();
    let old_offset = container.index().members["lindi.json"].header_offset;
    let huge = serde_json::to_vec(&serde_json::json!({"version": 1, "refs": {"k": "x".repeat(200_000)}})).unwrap();
    container.grow_member("lindi.json", &huge).unwrap();
    let new_offset = container.index().members["lindi.json"].header_offset;
    drop(container);

    assert_ne!(old_offset, new_offset);
    let source = lindi::tar::LocalFileSource::open(&path).unwrap();
    let (_entry, index) = lindi::tar::open_container(&source).unwrap();
    assert_eq!(index.members["lindi.json"].header_offset, new_offset);
    assert!(!index.members.values().any(|m| m.header_offset == old_offset));
}

#[test]
fn e5_corrupt_declared_size_surfaces_as_corrupt_reference() {
    {
        let mut config = lindi::global_config_mut();
        config.fetch_retry_base_delay = std::time::Duration::from_millis(1);
        config.fetch_retry_max_delay = std::time::Duration::from_millis(2);
    }

    let dir = tempfile::tempdir().unwrap();
    let remote = dir.path().join("remote.bin");
    std::fs::write(&remote, [1, 2, 3]).unwrap();

    let mut rfs = Rfs::new();
    rfs.set_external("g/d/0", format!("file://{}", remote.display()), 0, 9999);

    let path = dir.path().join("t.lindi.json");
    write_lindi(rfs, &path, ContainerFormat::Json).unwrap();

    let store = open_lindi(&path).unwrap();
    let err = store.get(&key("g/d/0")).unwrap_err();
    assert!(matches!(err, lindi::StoreError::Fetch(_) | lindi::StoreError::CorruptReference { .. }));
}

#[test]
fn writes_through_staging_are_visible_before_finalization() {
    let dir = tempfile::tempdir().unwrap();
    let container_path = dir.path().join("t.lindi.json");
    write_lindi(Rfs::new(), &container_path, ContainerFormat::Json).unwrap();

    let staging_dir = dir.path().join("staging");
    std::fs::create_dir_all(&staging_dir).unwrap();
    let store = open_lindi_read_write(&container_path, &staging_dir).unwrap();
    store.set(&key("g/d/0"), &[1, 2, 3]).unwrap();
    assert_eq!(store.get(&key("g/d/0")).unwrap(), vec![1, 2, 3]);
}
