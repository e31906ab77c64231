//! Merging many reference stores into one, concatenated along a dimension.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use serde_json::Value;

use crate::cftime::{TimeUnits, check_calendar};
use crate::discover::{EntryKind, discover};
use crate::error::IoResultExt;
use crate::job::DEFAULT_RECORD_SIZE;
use crate::metadata::{ArrayMetadataV2, ScalarKind, ScalarType};
use crate::reference::{ArrayRefs, ChunkRef, ReferenceSet};
use crate::store::{is_reference_store, read_store, with_store_suffix, write_store};
use crate::{Error, Result};

pub const DEFAULT_STORE_PATTERN: &str = "*.parquet";

#[derive(Debug, Clone)]
pub struct CombineOptions {
    pub pattern: String,
    pub record_size: u64,
    /// Dimension along which arrays are concatenated.
    pub concat_dim: String,
    /// Coordinates which must be equal in every input, and are kept once.
    pub identical_dims: Vec<String>,
}

impl Default for CombineOptions {
    fn default() -> Self {
        Self {
            pattern: DEFAULT_STORE_PATTERN.into(),
            record_size: DEFAULT_RECORD_SIZE,
            concat_dim: "time".into(),
            identical_dims: ["lat", "lon", "latitude", "longitude"]
                .map(String::from)
                .to_vec(),
        }
    }
}

/// Combine every reference store in `source_directory` matching `pattern` into `output_store`,
/// concatenating along `time`.
///
/// `.parquet` is appended to `output_store` if missing; the final path is returned.
pub fn combine(
    source_directory: &Path,
    output_store: &Path,
    pattern: &str,
    record_size: u64,
) -> Result<PathBuf> {
    let options = CombineOptions {
        pattern: pattern.into(),
        record_size,
        ..Default::default()
    };
    combine_with(source_directory, output_store, &options)
}

/// As [combine], with all merge parameters given.
pub fn combine_with(
    source_directory: &Path,
    output_store: &Path,
    options: &CombineOptions,
) -> Result<PathBuf> {
    let output = with_store_suffix(output_store);
    match combine_inner(source_directory, &output, options) {
        Ok(()) => {
            log::info!("Created {}", output.display());
            Ok(output)
        }
        Err(e) => {
            let e = e.into_merge(&output);
            log::error!("{e:?}");
            eprintln!("Failed creating {}: {e}", output.display());
            Err(e)
        }
    }
}

/// Reference stores in `source_directory` matching `pattern`, sorted lexicographically.
///
/// The order fixes the order of concatenation.
pub fn discover_stores(source_directory: &Path, pattern: &str) -> Result<Vec<String>> {
    let mut stores: Vec<String> = discover(source_directory, pattern, EntryKind::Directory)?
        .into_iter()
        .filter(|p| {
            let ok = is_reference_store(p);
            if !ok {
                log::warn!("Skipping {}: not a reference store", p.display());
            }
            ok
        })
        .map(|p| p.to_string_lossy().into_owned())
        .collect();
    stores.sort();
    Ok(stores)
}

fn combine_inner(source_directory: &Path, output: &Path, options: &CombineOptions) -> Result<()> {
    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).at(parent)?;
    }
    let existing_output = fs::canonicalize(output).ok();
    let mut stores = discover_stores(source_directory, &options.pattern)?;
    stores.retain(|s| {
        let is_output =
            existing_output.is_some() && fs::canonicalize(s).ok() == existing_output;
        if is_output {
            log::info!("Not combining the output store {s} into itself");
        }
        !is_output
    });
    if stores.is_empty() {
        return Err(Error::general(format!(
            "no reference stores in {} match {}",
            source_directory.display(),
            options.pattern
        )));
    }
    log::info!(
        "Combining {} reference stores along {}",
        stores.len(),
        options.concat_dim
    );

    let sets = stores
        .iter()
        .map(|s| {
            log::debug!("Reading {s}");
            read_store(Path::new(s))
        })
        .collect::<Result<Vec<_>>>()?;
    let merged = merge(&sets, &stores, options)?;
    write_store(&merged, output, options.record_size)
}

/// Merge reference sets in the given order. `names` identify the inputs in error messages.
pub fn merge(
    sets: &[ReferenceSet],
    names: &[String],
    options: &CombineOptions,
) -> Result<ReferenceSet> {
    let Some(first) = sets.first() else {
        return Err(Error::general("nothing to merge"));
    };
    let name = |i: usize| input_name(names, i);

    let mut out = ReferenceSet {
        groups: first.groups.clone(),
        arrays: Default::default(),
    };
    let paths: BTreeSet<&String> = sets.iter().flat_map(|s| s.arrays.keys()).collect();
    for path in paths {
        let versions: Vec<(usize, &ArrayRefs)> = sets
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.arrays.get(path).map(|a| (i, a)))
            .collect();
        let (first_idx, base) = versions[0];
        let dims = base.dimensions();
        let leaf = path.rsplit('/').next().unwrap_or(path);

        let merged = if let Some(axis) = dims.iter().position(|d| *d == options.concat_dim) {
            if let Some(missing) = (0..sets.len()).find(|i| !sets[*i].arrays.contains_key(path)) {
                return Err(Error::general(format!(
                    "{path} is missing from {}",
                    name(missing)
                )));
            }
            let arrays: Vec<&ArrayRefs> = versions.iter().map(|(_, a)| *a).collect();
            if dims.len() == 1 && leaf == options.concat_dim {
                concat_coordinate(path, &arrays, names)?
            } else {
                concat_array(path, &arrays, axis, names)?
            }
        } else if options.identical_dims.iter().any(|d| d == leaf) {
            check_identical(path, &versions, names)?;
            base.clone()
        } else {
            if versions.len() > 1 {
                log::debug!("Taking {path} from {}", name(first_idx));
            }
            base.clone()
        };
        out.arrays.insert(path.clone(), merged);
    }
    Ok(out)
}

fn input_name(names: &[String], i: usize) -> &str {
    names.get(i).map_or("<unnamed>", String::as_str)
}

fn in_input(path: &str, names: &[String], i: usize, e: impl std::fmt::Display) -> Error {
    Error::general(format!("{path} in {}: {e}", input_name(names, i)))
}

/// Everything but the extent along the concatenation axis must match.
fn check_compatible(base: &ArrayRefs, other: &ArrayRefs, axis: usize) -> Result<()> {
    let (b, o) = (&base.metadata, &other.metadata);
    let mismatch = |what: &str| Err(Error::general(format!("{what} differs from the first input")));
    if b.dtype != o.dtype {
        return mismatch("dtype");
    }
    if b.compressor != o.compressor || b.filters != o.filters {
        return mismatch("encoding");
    }
    if b.chunks != o.chunks || b.dimension_separator != o.dimension_separator {
        return mismatch("chunk shape");
    }
    if base.dimensions() != other.dimensions() {
        return mismatch("dimensions");
    }
    let other_extents = |m: &ArrayMetadataV2| {
        m.shape
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != axis)
            .map(|(_, n)| *n)
            .collect::<Vec<_>>()
    };
    if b.shape.len() != o.shape.len() || other_extents(b) != other_extents(o) {
        return mismatch("shape");
    }
    Ok(())
}

fn concat_array(
    path: &str,
    arrays: &[&ArrayRefs],
    axis: usize,
    names: &[String],
) -> Result<ArrayRefs> {
    for (i, arr) in arrays.iter().enumerate() {
        arr.metadata
            .validate()
            .map_err(|e| in_input(path, names, i, e))?;
        if axis >= arr.metadata.shape.len() {
            return Err(in_input(path, names, i, "dimension names do not match the shape"));
        }
    }
    let base = arrays[0];
    let chunk_len = base.metadata.chunks[axis];
    let mut total = 0;
    for (i, arr) in arrays.iter().enumerate() {
        check_compatible(base, arr, axis).map_err(|e| in_input(path, names, i, e))?;
        let len = arr.metadata.shape[axis];
        if i + 1 < arrays.len() && len % chunk_len != 0 {
            return Err(Error::general(format!(
                "{path} in {}: length {len} is not a whole number of chunks of {chunk_len}",
                input_name(names, i)
            )));
        }
        total += len;
    }

    let mut meta = base.metadata.clone();
    meta.shape[axis] = total;
    let mut out = ArrayRefs::new(meta, base.attributes.clone());
    let mut chunk_offset = 0;
    for arr in arrays {
        for (mut idx, chunk) in arr.present_chunks() {
            idx[axis] += chunk_offset;
            out.set_chunk(&idx, chunk.clone())?;
        }
        chunk_offset += arr.metadata.shape[axis].div_ceil(chunk_len);
    }
    Ok(out)
}

/// Decoded bytes of an uncompressed, fully inline 1-D array.
fn inline_values(arr: &ArrayRefs) -> Result<(ScalarType, Vec<u8>)> {
    if !arr.metadata.is_uncompressed() || arr.metadata.shape.len() != 1 {
        return Err(Error::general("values are not stored as plain inline bytes"));
    }
    let t = arr.metadata.data_type()?;
    let mut out = Vec::new();
    for chunk in &arr.chunks {
        match chunk {
            ChunkRef::Inline(b) => out.extend_from_slice(b),
            ChunkRef::Missing => return Err(Error::general("some values are missing")),
            ChunkRef::Remote { .. } => {
                return Err(Error::general("values are not stored inline"));
            }
        }
    }
    let len = arr.metadata.shape[0] as usize * t.size;
    if out.len() < len {
        return Err(Error::general("inline values are truncated"));
    }
    out.truncate(len);
    Ok((t, out))
}

fn str_attr<'a>(arr: &'a ArrayRefs, key: &str) -> Option<&'a str> {
    arr.attributes.get(key).and_then(Value::as_str)
}

/// Concatenate the values of the concatenation coordinate itself.
///
/// If the inputs use different time units, values are converted to the units of the first input.
fn concat_coordinate(path: &str, arrays: &[&ArrayRefs], names: &[String]) -> Result<ArrayRefs> {
    let base = arrays[0];
    let decoded = arrays
        .iter()
        .enumerate()
        .map(|(i, a)| inline_values(a).map_err(|e| in_input(path, names, i, e)))
        .collect::<Result<Vec<_>>>()?;

    let same_encoding = arrays.iter().all(|a| {
        a.metadata.dtype == base.metadata.dtype
            && str_attr(a, "units") == str_attr(base, "units")
            && str_attr(a, "calendar") == str_attr(base, "calendar")
    });

    let (dtype, bytes) = if same_encoding {
        let bytes: Vec<u8> = decoded.into_iter().flat_map(|(_, b)| b).collect();
        (base.metadata.dtype.clone(), bytes)
    } else {
        let units_of = |i: usize, a: &ArrayRefs| -> Result<TimeUnits> {
            check_calendar(str_attr(a, "calendar")).map_err(|e| in_input(path, names, i, e))?;
            str_attr(a, "units")
                .ok_or_else(|| in_input(path, names, i, "no time units"))?
                .parse::<TimeUnits>()
                .map_err(|e| in_input(path, names, i, e))
        };
        let target = units_of(0, base)?;
        log::info!("Converting {path} to '{target}'");
        let mut bytes = Vec::new();
        for (i, (a, (t, raw))) in arrays.iter().zip(&decoded).enumerate() {
            let units = units_of(i, a)?;
            for v in units.convert(&t.decode_f64(raw)?, &target) {
                bytes.extend_from_slice(&v.to_le_bytes());
            }
        }
        let f8 = ScalarType::new(ScalarKind::Float, 8, false);
        (f8.dtype(), bytes)
    };

    let t = ScalarType::parse(&dtype)?;
    let total = (bytes.len() / t.size) as u64;
    let meta = ArrayMetadataV2::new(vec![total], vec![total.max(1)], dtype)
        .with_fill_value(base.metadata.fill_value.clone());
    let mut out = ArrayRefs::new(meta, base.attributes.clone());
    if total > 0 {
        out.set_chunk(&[0], ChunkRef::Inline(Bytes::from(bytes)))?;
    }
    Ok(out)
}

/// Check that a coordinate is the same in every input.
fn check_identical(
    path: &str,
    versions: &[(usize, &ArrayRefs)],
    names: &[String],
) -> Result<()> {
    let (_, base) = versions[0];
    let base_values = inline_values(base).ok();
    for &(i, arr) in &versions[1..] {
        let differs = |what: &str| {
            Err(Error::general(format!(
                "{path} in {} has different {what} from {}",
                input_name(names, i),
                input_name(names, versions[0].0)
            )))
        };
        if arr.metadata.shape != base.metadata.shape || arr.metadata.dtype != base.metadata.dtype
        {
            return differs("shape or dtype");
        }
        match (&base_values, inline_values(arr).ok()) {
            (Some((_, a)), Some((_, b))) if *a != b => return differs("values"),
            (Some(_), Some(_)) => (),
            _ => log::debug!("Cannot compare values of {path}; assuming identical"),
        }
    }
    Ok(())
}
