//! Reading and writing the parquet reference store layout.
//!
//! ```text
//! name.parquet/
//! ├── .zmetadata        # consolidated zarr v2 metadata and the record size
//! └── temperature/
//!     ├── refs.0.parq   # chunk references 0..record_size
//!     └── refs.1.parq
//! ```
//!
//! Each partition has the columns `path`, `offset`, `size` and `raw`.
//! A row with a `raw` value is an inline chunk, a row with a `path` refers to a byte range
//! of that file, and a row with neither is a missing chunk.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use arrow_array::{Array, ArrayRef, BinaryArray, Int64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field, Schema, SchemaRef};
use bytes::Bytes;
use parquet::arrow::ArrowWriter;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::basic::{Compression, ZstdLevel};
use parquet::file::properties::WriterProperties;

use crate::error::IoResultExt;
use crate::metadata::{ArrayMetadataV2, Attributes, ConsolidatedMetadata, GroupMetadataV2};
use crate::reference::{ArrayRefs, ChunkRef, ReferenceSet};
use crate::{Error, Result};

/// Suffix of every reference store directory.
pub const STORE_SUFFIX: &str = ".parquet";
/// Name of the consolidated metadata document within a store.
pub const METADATA_KEY: &str = ".zmetadata";

const ZGROUP: &str = ".zgroup";
const ZATTRS: &str = ".zattrs";
const ZARRAY: &str = ".zarray";

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Whether `path` is a directory containing consolidated reference metadata.
pub fn is_reference_store(path: &Path) -> bool {
    path.join(METADATA_KEY).is_file()
}

/// `dir/<stem of input><STORE_SUFFIX>`.
pub fn store_path_for(input: &Path, dir: &Path) -> Result<PathBuf> {
    let stem = input
        .file_stem()
        .ok_or_else(|| Error::general(format!("{} has no file name", input.display())))?;
    let mut name = stem.to_os_string();
    name.push(STORE_SUFFIX);
    Ok(dir.join(name))
}

/// Append [STORE_SUFFIX] unless the path already ends with it.
pub fn with_store_suffix(path: &Path) -> PathBuf {
    let s = path.as_os_str().to_string_lossy();
    if s.ends_with(STORE_SUFFIX) {
        path.to_owned()
    } else {
        let mut p = path.as_os_str().to_os_string();
        p.push(STORE_SUFFIX);
        PathBuf::from(p)
    }
}

fn reference_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("path", DataType::Utf8, true),
        Field::new("offset", DataType::Int64, false),
        Field::new("size", DataType::Int64, false),
        Field::new("raw", DataType::Binary, true),
    ]))
}

fn partition_name(idx: u64) -> String {
    format!("refs.{idx}.parq")
}

/// Build the `.zmetadata` document, adding any implicit parent groups.
pub fn consolidate(refs: &ReferenceSet, record_size: u64) -> Result<ConsolidatedMetadata> {
    let mut groups = refs.groups.clone();
    groups.entry(String::new()).or_default();
    for path in refs.arrays.keys() {
        let mut parent = path.as_str();
        while let Some((p, _)) = parent.rsplit_once('/') {
            groups.entry(p.to_owned()).or_default();
            parent = p;
        }
    }

    let mut metadata = std::collections::BTreeMap::new();
    for (path, attrs) in &groups {
        metadata.insert(
            node_key(path, ZGROUP),
            serde_json::to_value(GroupMetadataV2::default())?,
        );
        metadata.insert(node_key(path, ZATTRS), attrs.clone().into());
    }
    for (path, arr) in &refs.arrays {
        if groups.contains_key(path) {
            return Err(Error::general(format!(
                "{path} is both a group and an array"
            )));
        }
        metadata.insert(node_key(path, ZARRAY), serde_json::to_value(&arr.metadata)?);
        metadata.insert(node_key(path, ZATTRS), arr.attributes.clone().into());
    }
    Ok(ConsolidatedMetadata {
        metadata,
        record_size,
    })
}

/// Store key of a metadata document for the node at `path`.
pub(crate) fn node_key(path: &str, name: &str) -> String {
    if path.is_empty() {
        name.to_owned()
    } else {
        format!("{path}/{name}")
    }
}

/// Split a metadata key into node path and document name.
fn split_node_key(key: &str) -> (&str, &str) {
    key.rsplit_once('/').unwrap_or(("", key))
}

/// Rebuild groups and array metadata (without chunks) from a `.zmetadata` document.
pub fn unconsolidate(meta: &ConsolidatedMetadata) -> Result<ReferenceSet> {
    let mut out = ReferenceSet::new();
    for (key, value) in &meta.metadata {
        match split_node_key(key) {
            (path, ZGROUP) => {
                out.groups.entry(path.to_owned()).or_default();
            }
            ("", ZARRAY) => return Err(Error::general("root node cannot be an array")),
            (path, ZARRAY) => {
                let m: ArrayMetadataV2 = serde_json::from_value(value.clone())?;
                m.validate()
                    .map_err(|e| Error::general(format!("{path}: {e}")))?;
                let attrs = match meta.metadata.get(&node_key(path, ZATTRS)) {
                    Some(serde_json::Value::Object(a)) => a.clone(),
                    _ => Attributes::new(),
                };
                out.arrays
                    .insert(path.to_owned(), ArrayRefs::new(m, attrs));
            }
            _ => (),
        }
    }
    let group_paths: Vec<String> = out.groups.keys().cloned().collect();
    for path in group_paths {
        if let Some(serde_json::Value::Object(a)) = meta.metadata.get(&node_key(&path, ZATTRS)) {
            out.groups.insert(path, a.clone());
        }
    }
    Ok(out)
}

/// Write a reference store at `path`.
///
/// The store is assembled in a hidden sibling directory and renamed into place,
/// so nothing appears under `path` unless the whole store was written.
/// An existing reference store at `path` is replaced.
pub fn write_store(refs: &ReferenceSet, path: &Path, record_size: u64) -> Result<()> {
    if record_size == 0 {
        return Err(Error::general("record size must be at least 1"));
    }
    check_replaceable(path)?;
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_owned(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent).at(&parent)?;

    let name = path
        .file_name()
        .ok_or_else(|| Error::general(format!("{} has no file name", path.display())))?;
    let tmp = parent.join(format!(
        ".{}.tmp-{}-{}",
        name.to_string_lossy(),
        std::process::id(),
        TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));

    let written = write_store_contents(refs, &tmp, record_size).and_then(|()| {
        if path.exists() {
            log::debug!("Replacing existing store {}", path.display());
            fs::remove_dir_all(path).at(path)?;
        }
        fs::rename(&tmp, path).at(path)
    });
    if written.is_err() && tmp.exists() {
        if let Err(e) = fs::remove_dir_all(&tmp) {
            log::warn!("Could not remove temporary store {}: {e}", tmp.display());
        }
    }
    written
}

fn check_replaceable(path: &Path) -> Result<()> {
    if !path.exists() || is_reference_store(path) {
        return Ok(());
    }
    let is_empty_dir = path.is_dir() && fs::read_dir(path).at(path)?.next().is_none();
    if is_empty_dir {
        Ok(())
    } else {
        Err(Error::io(
            path,
            std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                "exists and is not a reference store",
            ),
        ))
    }
}

fn write_store_contents(refs: &ReferenceSet, root: &Path, record_size: u64) -> Result<()> {
    fs::create_dir_all(root).at(root)?;
    let meta = consolidate(refs, record_size)?;

    let schema = reference_schema();
    let props = WriterProperties::builder()
        .set_compression(Compression::ZSTD(ZstdLevel::default()))
        .build();
    for (array_path, arr) in &refs.arrays {
        let dir = root.join(array_path);
        fs::create_dir_all(&dir).at(&dir)?;
        for (idx, records) in arr.chunks.chunks(record_size as usize).enumerate() {
            let file_path = dir.join(partition_name(idx as u64));
            write_partition(&file_path, records, &schema, props.clone())?;
        }
        log::debug!(
            "Wrote {} chunk references for {array_path}",
            arr.chunks.len()
        );
    }

    let meta_path = root.join(METADATA_KEY);
    let file = File::create(&meta_path).at(&meta_path)?;
    serde_json::to_writer(std::io::BufWriter::new(file), &meta)?;
    Ok(())
}

fn write_partition(
    path: &Path,
    records: &[ChunkRef],
    schema: &SchemaRef,
    props: WriterProperties,
) -> Result<()> {
    let paths: StringArray = records
        .iter()
        .map(|c| match c {
            ChunkRef::Remote { path, .. } => Some(path.as_str()),
            _ => None,
        })
        .collect();
    let offsets: Vec<i64> = records
        .iter()
        .map(|c| match c {
            ChunkRef::Remote { offset, .. } => *offset as i64,
            _ => 0,
        })
        .collect();
    let sizes: Vec<i64> = records
        .iter()
        .map(|c| c.size().unwrap_or(0) as i64)
        .collect();
    let raws: BinaryArray = records
        .iter()
        .map(|c| match c {
            ChunkRef::Inline(b) => Some(b.as_ref()),
            _ => None,
        })
        .collect();

    let batch = RecordBatch::try_new(
        schema.clone(),
        vec![
            Arc::new(paths) as ArrayRef,
            Arc::new(Int64Array::from(offsets)),
            Arc::new(Int64Array::from(sizes)),
            Arc::new(raws),
        ],
    )?;

    let file = File::create(path).at(path)?;
    let mut writer = ArrowWriter::try_new(file, schema.clone(), Some(props))?;
    writer.write(&batch)?;
    writer.close()?;
    Ok(())
}

/// Read only the `.zmetadata` document of a store.
pub fn read_consolidated(path: &Path) -> Result<ConsolidatedMetadata> {
    let meta_path = path.join(METADATA_KEY);
    let file = File::open(&meta_path).at(&meta_path)?;
    let meta = serde_json::from_reader(std::io::BufReader::new(file))?;
    Ok(meta)
}

/// Read a whole reference store into memory.
pub fn read_store(path: &Path) -> Result<ReferenceSet> {
    let meta = read_consolidated(path)?;
    if meta.record_size == 0 {
        return Err(Error::general(format!(
            "{} has a record size of 0",
            path.display()
        )));
    }
    let mut refs =
        unconsolidate(&meta).map_err(|e| Error::general(format!("{}: {e}", path.display())))?;
    for (array_path, arr) in refs.arrays.iter_mut() {
        let n_partitions = (arr.chunks.len() as u64).div_ceil(meta.record_size);
        for idx in 0..n_partitions {
            let file_path = path.join(array_path).join(partition_name(idx));
            if !file_path.is_file() {
                return Err(Error::io(
                    file_path,
                    std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        "reference partition is missing",
                    ),
                ));
            }
            let start = (idx * meta.record_size) as usize;
            let end = (start + meta.record_size as usize).min(arr.chunks.len());
            let records = read_partition(&file_path)?;
            for (slot, record) in arr.chunks[start..end].iter_mut().zip(records) {
                *slot = record;
            }
        }
    }
    Ok(refs)
}

fn column<'a, T: 'static>(batch: &'a RecordBatch, name: &str) -> Result<&'a T> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<T>())
        .ok_or_else(|| Error::general(format!("reference partition has no valid '{name}' column")))
}

fn read_partition(path: &Path) -> Result<Vec<ChunkRef>> {
    let file = File::open(path).at(path)?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)?.build()?;
    let mut out = Vec::new();
    for batch in reader {
        let batch = batch?;
        let paths = column::<StringArray>(&batch, "path")?;
        let offsets = column::<Int64Array>(&batch, "offset")?;
        let sizes = column::<Int64Array>(&batch, "size")?;
        let raws = column::<BinaryArray>(&batch, "raw")?;
        for i in 0..batch.num_rows() {
            let record = if !raws.is_null(i) {
                ChunkRef::Inline(Bytes::copy_from_slice(raws.value(i)))
            } else if !paths.is_null(i) {
                let (offset, size) = (offsets.value(i), sizes.value(i));
                if offset < 0 || size < 0 {
                    return Err(Error::general(format!(
                        "negative byte range in {}",
                        path.display()
                    )));
                }
                ChunkRef::Remote {
                    path: paths.value(i).to_owned(),
                    offset: offset as u64,
                    size: size as u64,
                }
            } else {
                ChunkRef::Missing
            };
            out.push(record);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::ARRAY_DIMENSIONS;

    fn sample() -> ReferenceSet {
        let mut refs = ReferenceSet::new();
        refs.groups
            .get_mut("")
            .unwrap()
            .insert("title".into(), "sample".into());
        let mut attrs = Attributes::new();
        attrs.insert(ARRAY_DIMENSIONS.into(), serde_json::json!(["x"]));
        let mut arr = ArrayRefs::new(ArrayMetadataV2::new(vec![5], vec![1], "<f4"), attrs);
        arr.chunks[0] = ChunkRef::Remote {
            path: "/data/a.nc".into(),
            offset: 100,
            size: 4,
        };
        arr.chunks[3] = ChunkRef::Inline(Bytes::from_static(&[0, 0, 128, 63]));
        refs.arrays.insert("grp/v".into(), arr);
        refs
    }

    #[test]
    fn write_then_read_with_small_partitions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.parquet");
        let refs = sample();
        write_store(&refs, &path, 2).unwrap();

        assert!(is_reference_store(&path));
        assert!(path.join("grp/v/refs.2.parq").is_file());
        assert!(!path.join("grp/v/refs.3.parq").exists());

        let back = read_store(&path).unwrap();
        assert_eq!(back.arrays, refs.arrays);
        assert!(back.groups.contains_key("grp"));
        assert_eq!(back.root_attributes().unwrap()["title"], "sample");
    }

    #[test]
    fn rewrite_replaces_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.parquet");
        write_store(&sample(), &path, 1).unwrap();
        assert!(path.join("grp/v/refs.4.parq").is_file());
        write_store(&sample(), &path, 10).unwrap();
        assert!(!path.join("grp/v/refs.4.parq").exists());
        assert_eq!(read_store(&path).unwrap().arrays, sample().arrays);
        // no temporary directories are left behind
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn refuses_to_replace_other_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.parquet");
        fs::create_dir(&path).unwrap();
        fs::write(path.join("precious.txt"), b"data").unwrap();
        let err = write_store(&sample(), &path, 10).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Io);
        assert!(path.join("precious.txt").is_file());
    }

    #[test]
    fn missing_partition_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.parquet");
        write_store(&sample(), &path, 2).unwrap();
        fs::remove_file(path.join("grp/v/refs.1.parq")).unwrap();
        let err = read_store(&path).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Io);
        assert!(err.to_string().contains("refs.1.parq"), "{err}");
    }

    #[test]
    fn invalid_chunk_shape_is_an_error() {
        let mut meta = consolidate(&sample(), 10).unwrap();
        meta.metadata.insert(
            "grp/v/.zarray".into(),
            serde_json::to_value(ArrayMetadataV2::new(vec![5], vec![0], "<f4")).unwrap(),
        );
        let err = unconsolidate(&meta).unwrap_err();
        assert!(err.to_string().contains("grp/v"), "{err}");
    }

    #[test]
    fn store_paths() {
        assert_eq!(
            store_path_for(Path::new("/in/era5_2000.nc"), Path::new("out")).unwrap(),
            PathBuf::from("out/era5_2000.parquet")
        );
        assert_eq!(
            with_store_suffix(Path::new("out/combined")),
            PathBuf::from("out/combined.parquet")
        );
        assert_eq!(
            with_store_suffix(Path::new("out/combined.parquet")),
            PathBuf::from("out/combined.parquet")
        );
    }
}
