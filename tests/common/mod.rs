#![allow(dead_code)]

use std::fs;
use std::path::Path;
use std::sync::Arc;

use serde_json::json;
use zarrs_kerchunk::extract::ReferenceExtractor;
use zarrs_kerchunk::metadata::{ARRAY_DIMENSIONS, ArrayMetadataV2, Attributes};
use zarrs_kerchunk::reference::{ArrayRefs, ChunkRef, ReferenceSet};
use zarrs_kerchunk::storage::ReferenceStore;
use zarrs_kerchunk::{Error, Result};

pub fn setup() -> tempfile::TempDir {
    env_logger::try_init().ok();
    tempfile::tempdir().expect("create temp dir")
}

/// Treats each input as a flat little-endian f32 array, referenced as one chunk.
///
/// Inputs with "bad" in their name fail.
pub struct RawF32Extractor;

impl ReferenceExtractor for RawF32Extractor {
    fn extract(&self, input: &Path) -> Result<ReferenceSet> {
        if input
            .file_name()
            .is_some_and(|n| n.to_string_lossy().contains("bad"))
        {
            return Err(Error::general("unreadable input"));
        }
        let path = fs::canonicalize(input).map_err(|e| Error::io(input, e))?;
        let size = fs::metadata(&path).map_err(|e| Error::io(input, e))?.len();
        let n = size / 4;

        let mut attrs = Attributes::new();
        attrs.insert(ARRAY_DIMENSIONS.into(), json!(["x"]));
        let mut arr = ArrayRefs::new(
            ArrayMetadataV2::new(vec![n], vec![n.max(1)], "<f4"),
            attrs,
        );
        if n > 0 {
            arr.set_chunk(
                &[0],
                ChunkRef::Remote {
                    path: path.to_string_lossy().into_owned(),
                    offset: 0,
                    size: n * 4,
                },
            )?;
        }
        let mut refs = ReferenceSet::new();
        refs.arrays.insert("values".into(), arr);
        Ok(refs)
    }
}

pub fn write_f32(path: &Path, values: &[f32]) {
    let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
    fs::write(path, bytes).expect("write raw file");
}

/// Read a whole f32 array from a reference store through zarrs.
pub fn read_f32(store_path: &Path, array: &str) -> (Vec<u64>, Vec<f32>) {
    let store = Arc::new(ReferenceStore::open(store_path).expect("open reference store"));
    let array = zarrs::array::Array::open(store.clone(), &format!("/{array}")).expect("open array");
    let shape = array.shape().to_vec();
    let data: Vec<f32> = array
        .retrieve_array_subset(&array.subset_all())
        .expect("retrieve all data");
    (shape, data)
}

/// Names of the entries in a directory, sorted.
pub fn entry_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .expect("read dir")
        .map(|e| e.expect("dir entry").file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}
