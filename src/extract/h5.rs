//! Chunk references from HDF5 and netCDF-4 files.

use std::path::Path;

use bytes::Bytes;
use hdf5::datatype::ByteOrder;
use hdf5::filters::Filter;
use hdf5::types::{
    FixedAscii, FixedUnicode, FloatSize, IntSize, TypeDescriptor, VarLenArray, VarLenAscii,
    VarLenUnicode,
};
use hdf5::{Attribute, Dataset, Datatype, Group, Location, ObjectReference1, ReferencedObject};
use serde_json::Value;

use super::ReferenceExtractor;
use crate::error::IoResultExt;
use crate::metadata::{ARRAY_DIMENSIONS, ArrayMetadataV2, Attributes, CodecV2, ScalarKind, ScalarType};
use crate::reference::{ArrayRefs, ChunkRef, ReferenceSet};
use crate::{Error, Result};

/// HDF5 and netCDF bookkeeping attributes which have no meaning in zarr.
const SKIPPED_ATTRIBUTES: &[&str] = &[
    "CLASS",
    "DIMENSION_LIST",
    "NAME",
    "REFERENCE_LIST",
    "_FillValue",
    "_NCProperties",
    "_Netcdf4Coordinates",
    "_Netcdf4Dimid",
];

/// Longer fixed-length string attributes are truncated.
const MAX_STRING_LEN: usize = 8192;

/// Indexes HDF5 and netCDF-4 files with the HDF5 library.
#[derive(Debug, Clone, Copy, Default)]
pub struct Hdf5Extractor;

impl ReferenceExtractor for Hdf5Extractor {
    fn extract(&self, input: &Path) -> Result<ReferenceSet> {
        let source = std::fs::canonicalize(input).at(input)?;
        let source_str = source
            .to_str()
            .ok_or_else(|| Error::general(format!("{} is not valid UTF-8", source.display())))?
            .to_owned();
        let file = hdf5::File::open(&source)?;
        let mut refs = ReferenceSet::new();
        visit_group(&file, "", &source_str, &mut refs)?;
        log::debug!(
            "Indexed {} arrays in {} groups of {}",
            refs.arrays.len(),
            refs.groups.len(),
            source.display()
        );
        Ok(refs)
    }
}

fn leaf_name(full: &str) -> &str {
    full.rsplit('/').next().unwrap_or(full)
}

fn join(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_owned()
    } else {
        format!("{parent}/{name}")
    }
}

fn visit_group(group: &Group, path: &str, source: &str, refs: &mut ReferenceSet) -> Result<()> {
    refs.groups
        .insert(path.to_owned(), read_attributes(group)?);

    let datasets = group.datasets()?;
    let coords = dimension_coordinates(&datasets);
    for ds in &datasets {
        let full_name = ds.name();
        let name = leaf_name(&full_name);
        match index_dataset(ds, name, &coords, source)? {
            Some(arr) => {
                refs.arrays.insert(join(path, name), arr);
            }
            None => log::warn!("Skipping {full_name}: unsupported data type"),
        }
    }

    for child in group.groups()? {
        let full_name = child.name();
        visit_group(&child, &join(path, leaf_name(&full_name)), source, refs)?;
    }
    Ok(())
}

fn is_dimension_scale(ds: &Dataset) -> bool {
    ds.attr("CLASS")
        .ok()
        .and_then(|a| attribute_value(&a).ok().flatten())
        .is_some_and(|v| v == "DIMENSION_SCALE")
}

/// Names and lengths of the 1-D datasets which act as dimensions in this group.
///
/// These are the HDF5 dimension scales, or every 1-D dataset if the group has none.
fn dimension_coordinates(datasets: &[Dataset]) -> Vec<(String, u64)> {
    let one_d: Vec<&Dataset> = datasets.iter().filter(|d| d.ndim() == 1).collect();
    let scales: Vec<&Dataset> = one_d
        .iter()
        .copied()
        .filter(|d| is_dimension_scale(d))
        .collect();
    let chosen = if scales.is_empty() { one_d } else { scales };
    chosen
        .into_iter()
        .map(|d| (leaf_name(&d.name()).to_owned(), d.shape()[0] as u64))
        .collect()
}

/// Name of the dimension scale attached to each axis through `DIMENSION_LIST`.
///
/// Empty when the dataset has no scales attached.
fn attached_scales(ds: &Dataset, ndim: usize) -> Vec<Option<String>> {
    let Ok(attr) = ds.attr("DIMENSION_LIST") else {
        return Vec::new();
    };
    let lists = match attr.read_raw::<VarLenArray<ObjectReference1>>() {
        Ok(lists) => lists,
        Err(e) => {
            log::debug!("Could not read DIMENSION_LIST of {}: {e}", ds.name());
            return Vec::new();
        }
    };
    if lists.len() != ndim {
        log::debug!("DIMENSION_LIST of {} does not match its rank", ds.name());
        return Vec::new();
    }
    lists
        .iter()
        .map(|refs| {
            let scale = refs.as_slice().first()?;
            match ds.dereference(scale) {
                Ok(ReferencedObject::Dataset(d)) => Some(leaf_name(&d.name()).to_owned()),
                Ok(_) => None,
                Err(e) => {
                    log::debug!("Could not resolve a dimension scale of {}: {e}", ds.name());
                    None
                }
            }
        })
        .collect()
}

/// Name each axis after its attached dimension scale.
///
/// Axes without one take an unused dimension coordinate of the same length.
fn dimension_names(
    name: &str,
    shape: &[u64],
    coords: &[(String, u64)],
    attached: &[Option<String>],
) -> Vec<String> {
    if shape.len() == 1 && coords.iter().any(|(c, _)| c == name) {
        return vec![name.to_owned()];
    }
    let mut used: Vec<bool> = coords
        .iter()
        .map(|(c, _)| attached.iter().flatten().any(|a| a == c))
        .collect();
    shape
        .iter()
        .enumerate()
        .map(|(axis, &len)| {
            if let Some(Some(scale)) = attached.get(axis) {
                return scale.clone();
            }
            let found = coords
                .iter()
                .enumerate()
                .position(|(i, (_, l))| !used[i] && *l == len);
            match found {
                Some(i) => {
                    used[i] = true;
                    coords[i].0.clone()
                }
                None => format!("phony_dim_{len}"),
            }
        })
        .collect()
}

fn int_size(size: IntSize) -> usize {
    match size {
        IntSize::U1 => 1,
        IntSize::U2 => 2,
        IntSize::U4 => 4,
        IntSize::U8 => 8,
    }
}

fn scalar_type(dtype: &Datatype) -> Result<Option<ScalarType>> {
    let big_endian = matches!(dtype.byte_order(), ByteOrder::BigEndian);
    let t = match dtype.to_descriptor()? {
        TypeDescriptor::Integer(s) => ScalarType::new(ScalarKind::Int, int_size(s), big_endian),
        TypeDescriptor::Unsigned(s) => ScalarType::new(ScalarKind::UInt, int_size(s), big_endian),
        TypeDescriptor::Float(FloatSize::U4) => ScalarType::new(ScalarKind::Float, 4, big_endian),
        TypeDescriptor::Float(FloatSize::U8) => ScalarType::new(ScalarKind::Float, 8, big_endian),
        TypeDescriptor::Boolean => ScalarType::new(ScalarKind::Bool, 1, false),
        _ => return Ok(None),
    };
    Ok(Some(t))
}

fn convert_filters(filters: &[Filter], element_size: usize) -> Result<(Vec<CodecV2>, Option<CodecV2>)> {
    let mut out = Vec::new();
    let mut compressor = None;
    for filter in filters {
        if compressor.is_some() {
            return Err(Error::general("deflate must be the last HDF5 filter"));
        }
        match filter {
            Filter::Shuffle => out.push(CodecV2::Shuffle {
                elementsize: element_size as u32,
            }),
            Filter::Deflate(level) => {
                compressor = Some(CodecV2::Zlib {
                    level: u32::from(*level),
                })
            }
            other => {
                return Err(Error::general(format!(
                    "unsupported HDF5 filter: {other:?}"
                )));
            }
        }
    }
    Ok((out, compressor))
}

fn to_le<T, const N: usize>(values: Vec<T>, f: fn(T) -> [u8; N]) -> Vec<u8> {
    values.into_iter().flat_map(f).collect()
}

/// Decoded values of the whole dataset as little-endian bytes.
fn read_le_bytes(ds: &Dataset, t: ScalarType) -> Result<Vec<u8>> {
    let out = match (t.kind, t.size) {
        (ScalarKind::Float, 4) => to_le(ds.read_raw::<f32>()?, f32::to_le_bytes),
        (ScalarKind::Float, _) => to_le(ds.read_raw::<f64>()?, f64::to_le_bytes),
        (ScalarKind::Int, 1) => to_le(ds.read_raw::<i8>()?, i8::to_le_bytes),
        (ScalarKind::Int, 2) => to_le(ds.read_raw::<i16>()?, i16::to_le_bytes),
        (ScalarKind::Int, 4) => to_le(ds.read_raw::<i32>()?, i32::to_le_bytes),
        (ScalarKind::Int, _) => to_le(ds.read_raw::<i64>()?, i64::to_le_bytes),
        (ScalarKind::UInt, 1) => ds.read_raw::<u8>()?,
        (ScalarKind::UInt, 2) => to_le(ds.read_raw::<u16>()?, u16::to_le_bytes),
        (ScalarKind::UInt, 4) => to_le(ds.read_raw::<u32>()?, u32::to_le_bytes),
        (ScalarKind::UInt, _) => to_le(ds.read_raw::<u64>()?, u64::to_le_bytes),
        (ScalarKind::Bool, _) => ds.read_raw::<bool>()?.into_iter().map(u8::from).collect(),
    };
    Ok(out)
}

/// Shape of a single chunk covering the whole array.
fn whole_array_chunk(shape: &[u64]) -> Vec<u64> {
    shape.iter().map(|&n| n.max(1)).collect()
}

fn index_dataset(
    ds: &Dataset,
    name: &str,
    coords: &[(String, u64)],
    source: &str,
) -> Result<Option<ArrayRefs>> {
    let Some(t) = scalar_type(&ds.dtype()?)? else {
        return Ok(None);
    };
    let shape: Vec<u64> = ds.shape().iter().map(|&n| n as u64).collect();

    let fill_value = match ds.attr("_FillValue") {
        Ok(a) => attribute_value(&a)?.unwrap_or_else(|| Value::from(0)),
        Err(_) => Value::from(0),
    };
    let mut attrs = read_attributes(ds)?;
    attrs.insert(
        ARRAY_DIMENSIONS.into(),
        dimension_names(name, &shape, coords, &attached_scales(ds, shape.len())).into(),
    );

    let is_coordinate = shape.len() == 1 && coords.iter().any(|(c, _)| c == name);
    if is_coordinate {
        return inline_array(ds, t, shape, attrs, fill_value).map(Some);
    }

    if ds.is_chunked() {
        let chunk_shape: Vec<u64> = ds
            .chunk()
            .ok_or_else(|| Error::general(format!("{name} is chunked without a chunk shape")))?
            .into_iter()
            .map(|n| n as u64)
            .collect();
        let (filters, compressor) = convert_filters(&ds.filters(), t.size)
            .map_err(|e| Error::general(format!("{name}: {e}")))?;
        let meta = ArrayMetadataV2::new(shape, chunk_shape.clone(), t.dtype())
            .with_filters(filters)
            .with_compressor(compressor)
            .with_fill_value(fill_value);
        let mut arr = ArrayRefs::new(meta, attrs);
        let num_chunks = ds
            .num_chunks()
            .ok_or_else(|| Error::general(format!("cannot count the chunks of {name}")))?;
        for idx in 0..num_chunks {
            let info = ds
                .chunk_info(idx)
                .ok_or_else(|| Error::general(format!("no info for chunk {idx} of {name}")))?;
            if info.filter_mask != 0 {
                return Err(Error::general(format!(
                    "chunk {idx} of {name} skips some filters"
                )));
            }
            let grid: Vec<u64> = info
                .offset
                .iter()
                .zip(&chunk_shape)
                .map(|(&o, &c)| o / c)
                .collect();
            arr.set_chunk(
                &grid,
                ChunkRef::Remote {
                    path: source.to_owned(),
                    offset: info.addr,
                    size: info.size,
                },
            )?;
        }
        return Ok(Some(arr));
    }

    let storage_size = ds.storage_size();
    match ds.offset() {
        Some(offset) if storage_size > 0 => {
            let meta = ArrayMetadataV2::new(shape.clone(), whole_array_chunk(&shape), t.dtype())
                .with_fill_value(fill_value);
            let mut arr = ArrayRefs::new(meta, attrs);
            if !arr.chunks.is_empty() {
                arr.set_chunk(
                    &vec![0; shape.len()],
                    ChunkRef::Remote {
                        path: source.to_owned(),
                        offset,
                        size: storage_size,
                    },
                )?;
            }
            Ok(Some(arr))
        }
        // compact layout, which lives in the object header
        _ if storage_size > 0 => inline_array(ds, t, shape, attrs, fill_value).map(Some),
        _ => {
            let meta = ArrayMetadataV2::new(shape.clone(), whole_array_chunk(&shape), t.dtype())
                .with_fill_value(fill_value);
            Ok(Some(ArrayRefs::new(meta, attrs)))
        }
    }
}

/// Store the decoded values as a single uncompressed little-endian chunk.
fn inline_array(
    ds: &Dataset,
    t: ScalarType,
    shape: Vec<u64>,
    attrs: Attributes,
    fill_value: Value,
) -> Result<ArrayRefs> {
    let t = ScalarType::new(t.kind, t.size, false);
    let meta = ArrayMetadataV2::new(shape.clone(), whole_array_chunk(&shape), t.dtype())
        .with_fill_value(fill_value);
    let mut arr = ArrayRefs::new(meta, attrs);
    if !arr.chunks.is_empty() {
        let bytes = read_le_bytes(ds, t)?;
        arr.set_chunk(&vec![0; shape.len()], ChunkRef::Inline(Bytes::from(bytes)))?;
    }
    Ok(arr)
}

fn float_value(v: f64) -> Value {
    if v.is_nan() {
        Value::from("NaN")
    } else if v.is_infinite() {
        Value::from(if v > 0.0 { "Infinity" } else { "-Infinity" })
    } else {
        Value::from(v)
    }
}

fn strings<S: AsRef<str>>(values: Vec<S>) -> Vec<Value> {
    values
        .iter()
        .map(|s| Value::from(s.as_ref().trim_end_matches('\0')))
        .collect()
}

/// JSON form of an attribute; length-1 arrays are unwrapped.
///
/// Returns None for types with no JSON equivalent.
fn attribute_value(attr: &Attribute) -> Result<Option<Value>> {
    let values: Vec<Value> = match attr.dtype()?.to_descriptor()? {
        TypeDescriptor::Integer(_) => attr.read_raw::<i64>()?.into_iter().map(Value::from).collect(),
        TypeDescriptor::Unsigned(_) => attr.read_raw::<u64>()?.into_iter().map(Value::from).collect(),
        TypeDescriptor::Float(_) => attr.read_raw::<f64>()?.into_iter().map(float_value).collect(),
        TypeDescriptor::Boolean => attr.read_raw::<bool>()?.into_iter().map(Value::from).collect(),
        TypeDescriptor::FixedAscii(_) => {
            strings(attr.read_raw::<FixedAscii<MAX_STRING_LEN>>()?)
        }
        TypeDescriptor::FixedUnicode(_) => {
            strings(attr.read_raw::<FixedUnicode<MAX_STRING_LEN>>()?)
        }
        TypeDescriptor::VarLenAscii => strings(attr.read_raw::<VarLenAscii>()?),
        TypeDescriptor::VarLenUnicode => strings(attr.read_raw::<VarLenUnicode>()?),
        _ => return Ok(None),
    };
    let value = if values.len() == 1 {
        values.into_iter().next().unwrap_or(Value::Null)
    } else {
        Value::Array(values)
    };
    Ok(Some(value))
}

fn read_attributes(loc: &Location) -> Result<Attributes> {
    let mut out = Attributes::new();
    for name in loc.attr_names()? {
        if SKIPPED_ATTRIBUTES.contains(&name.as_str()) {
            continue;
        }
        let value = loc.attr(&name).map_err(Error::from).and_then(|a| attribute_value(&a));
        match value {
            Ok(Some(v)) => {
                out.insert(name, v);
            }
            Ok(None) => log::debug!("Skipping attribute {name} of unsupported type"),
            Err(e) => log::warn!("Could not read attribute {name}: {e}"),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coords() -> Vec<(String, u64)> {
        vec![("lat".into(), 2), ("lon".into(), 2), ("time".into(), 1)]
    }

    #[test]
    fn dimension_names_by_length() {
        assert_eq!(
            dimension_names("t2m", &[1, 2, 2], &coords(), &[]),
            vec!["time", "lat", "lon"]
        );
        assert_eq!(dimension_names("lon", &[2], &coords(), &[]), vec!["lon"]);
        assert_eq!(
            dimension_names("other", &[7], &coords(), &[]),
            vec!["phony_dim_7"]
        );
    }

    #[test]
    fn attached_scales_take_precedence() {
        let attached = [None, Some("lon".to_owned()), Some("lat".to_owned())];
        assert_eq!(
            dimension_names("t2m", &[1, 2, 2], &coords(), &attached),
            vec!["time", "lon", "lat"]
        );
        // lat is taken by the second axis, so the first falls back to lon
        let partial = [None, Some("lat".to_owned())];
        assert_eq!(
            dimension_names("uv", &[2, 2], &coords(), &partial),
            vec!["lon", "lat"]
        );
    }

    #[test]
    fn filters_map_to_numcodecs() {
        let (filters, compressor) =
            convert_filters(&[Filter::Shuffle, Filter::Deflate(4)], 4).unwrap();
        assert_eq!(filters, vec![CodecV2::Shuffle { elementsize: 4 }]);
        assert_eq!(compressor, Some(CodecV2::Zlib { level: 4 }));
        assert!(convert_filters(&[Filter::Deflate(4), Filter::Shuffle], 4).is_err());
        assert!(convert_filters(&[Filter::Fletcher32], 4).is_err());
    }

    #[test]
    fn string_nul_padding_is_trimmed() {
        assert_eq!(strings(vec!["abc\0\0"]), vec![Value::from("abc")]);
    }
}
