mod common;

use std::fs;
use std::path::Path;

use bytes::Bytes;
use common::{read_f32, setup, write_f32};
use serde_json::json;
use zarrs_kerchunk::ErrorKind;
use zarrs_kerchunk::combine::combine;
use zarrs_kerchunk::metadata::{ARRAY_DIMENSIONS, ArrayMetadataV2, Attributes, ScalarType};
use zarrs_kerchunk::reference::{ArrayRefs, ChunkRef, ReferenceSet};
use zarrs_kerchunk::store::{METADATA_KEY, read_store, write_store};

fn dims(names: &[&str]) -> Attributes {
    let mut a = Attributes::new();
    a.insert(ARRAY_DIMENSIONS.into(), json!(names));
    a
}

fn inline_f64(values: &[f64], attrs: Attributes) -> ArrayRefs {
    let n = values.len() as u64;
    let mut arr = ArrayRefs::new(ArrayMetadataV2::new(vec![n], vec![n], "<f8"), attrs);
    let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
    arr.set_chunk(&[0], ChunkRef::Inline(Bytes::from(bytes)))
        .unwrap();
    arr
}

/// A one-timestep store whose `t2m` values live in a raw file next to it.
fn make_store(dir: &Path, name: &str, time: f64, units: &str, t2m: [f32; 2]) {
    let raw = dir.join(format!("{name}.bin"));
    write_f32(&raw, &t2m);

    let mut refs = ReferenceSet::new();
    refs.groups
        .get_mut("")
        .unwrap()
        .insert("source".into(), json!(name));

    let mut time_attrs = dims(&["time"]);
    time_attrs.insert("units".into(), json!(units));
    refs.arrays
        .insert("time".into(), inline_f64(&[time], time_attrs));
    refs.arrays
        .insert("lat".into(), inline_f64(&[-10.0, 10.0], dims(&["lat"])));

    let mut arr = ArrayRefs::new(
        ArrayMetadataV2::new(vec![1, 2], vec![1, 2], "<f4"),
        dims(&["time", "lat"]),
    );
    arr.set_chunk(
        &[0, 0],
        ChunkRef::Remote {
            path: fs::canonicalize(&raw).unwrap().to_string_lossy().into_owned(),
            offset: 0,
            size: 8,
        },
    )
    .unwrap();
    refs.arrays.insert("t2m".into(), arr);

    write_store(&refs, &dir.join(format!("{name}.parquet")), 100).unwrap();
}

fn time_values(store: &Path) -> Vec<f64> {
    let refs = read_store(store).unwrap();
    let time = &refs.arrays["time"];
    let ChunkRef::Inline(bytes) = &time.chunks[0] else {
        panic!("time is not inline");
    };
    ScalarType::parse(&time.metadata.dtype)
        .unwrap()
        .decode_f64(bytes)
        .unwrap()
}

#[test]
fn combines_in_lexicographic_order() {
    let tmp = setup();
    let src = tmp.path().join("stores");
    fs::create_dir(&src).unwrap();
    let units = "days since 2000-01-01";
    // created out of order
    make_store(&src, "day2", 2.0, units, [5.0, 6.0]);
    make_store(&src, "day0", 0.0, units, [1.0, 2.0]);
    make_store(&src, "day1", 1.0, units, [3.0, 4.0]);

    let out = combine(&src, &tmp.path().join("combined"), "*.parquet", 10).unwrap();
    assert_eq!(out, tmp.path().join("combined.parquet"));
    assert_eq!(time_values(&out), vec![0.0, 1.0, 2.0]);

    let (shape, data) = read_f32(&out, "t2m");
    assert_eq!(shape, vec![3, 2]);
    assert_eq!(data, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);

    let refs = read_store(&out).unwrap();
    assert_eq!(refs.arrays["lat"].metadata.shape, vec![2]);
    assert_eq!(refs.root_attributes().unwrap()["source"], "day0");
}

#[test]
fn time_units_follow_the_first_store() {
    let tmp = setup();
    make_store(tmp.path(), "a", 1.0, "days since 2000-01-01", [0.0; 2]);
    make_store(tmp.path(), "b", 48.0, "hours since 2000-01-01", [0.0; 2]);
    make_store(tmp.path(), "c", 0.0, "days since 2000-01-04", [0.0; 2]);

    let out = combine(tmp.path(), &tmp.path().join("out/all.parquet"), "*.parquet", 10).unwrap();
    assert_eq!(time_values(&out), vec![1.0, 2.0, 3.0]);
    let refs = read_store(&out).unwrap();
    assert_eq!(refs.arrays["time"].attributes["units"], "days since 2000-01-01");
}

#[test]
fn output_store_is_not_its_own_input() {
    let tmp = setup();
    let units = "days since 2000-01-01";
    make_store(tmp.path(), "a", 0.0, units, [0.0; 2]);
    make_store(tmp.path(), "b", 1.0, units, [0.0; 2]);

    let target = tmp.path().join("combined.parquet");
    combine(tmp.path(), &target, "*.parquet", 10).unwrap();
    combine(tmp.path(), &target, "*.parquet", 10).unwrap();
    assert_eq!(time_values(&target), vec![0.0, 1.0]);
}

#[test]
fn small_record_size_splits_partitions() {
    let tmp = setup();
    let units = "days since 2000-01-01";
    for (i, name) in ["a", "b", "c"].iter().enumerate() {
        make_store(tmp.path(), name, i as f64, units, [i as f32; 2]);
    }
    let out = combine(tmp.path(), &tmp.path().join("out"), "*.parquet", 1).unwrap();
    let partitions = fs::read_dir(out.join("t2m")).unwrap().count();
    assert_eq!(partitions, 3);
    assert_eq!(read_f32(&out, "t2m").1, vec![0.0, 0.0, 1.0, 1.0, 2.0, 2.0]);
}

#[test]
fn no_stores_is_a_merge_failure() {
    let tmp = setup();
    fs::write(tmp.path().join("x.parquet"), b"a file, not a store").unwrap();
    let err = combine(tmp.path(), &tmp.path().join("out"), "*.parquet", 10).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Merge);
    assert_eq!(err.exit_code(), 4);
    assert!(!tmp.path().join("out.parquet").exists());
}

#[test]
fn zero_chunk_extent_is_a_merge_failure() {
    let tmp = setup();
    let units = "days since 2000-01-01";
    make_store(tmp.path(), "a", 0.0, units, [0.0; 2]);
    make_store(tmp.path(), "b", 1.0, units, [0.0; 2]);

    // hand-edited metadata with a zero chunk extent along time
    let zmetadata = tmp.path().join("b.parquet").join(METADATA_KEY);
    let mut doc: serde_json::Value = serde_json::from_slice(&fs::read(&zmetadata).unwrap()).unwrap();
    doc["metadata"]["t2m/.zarray"]["chunks"] = json!([0, 2]);
    fs::write(&zmetadata, serde_json::to_vec(&doc).unwrap()).unwrap();

    let err = combine(tmp.path(), &tmp.path().join("out"), "*.parquet", 10).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Merge);
    assert_eq!(err.exit_code(), 4);
    assert!(err.to_string().contains("b.parquet"), "{err}");
    assert!(!tmp.path().join("out.parquet").exists());
}
