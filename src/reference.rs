//! In-memory model of a reference store.

use std::collections::BTreeMap;

use bytes::Bytes;

use crate::metadata::{ARRAY_DIMENSIONS, ArrayMetadataV2, Attributes};

/// Where the encoded bytes of one chunk live.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ChunkRef {
    /// Never written; reads as the fill value.
    #[default]
    Missing,
    /// A byte range of a file on the local filesystem.
    Remote { path: String, offset: u64, size: u64 },
    /// The encoded chunk, stored in the reference store itself.
    Inline(Bytes),
}

impl ChunkRef {
    pub fn is_missing(&self) -> bool {
        matches!(self, Self::Missing)
    }

    /// Size of the encoded chunk, if any.
    pub fn size(&self) -> Option<u64> {
        match self {
            Self::Missing => None,
            Self::Remote { size, .. } => Some(*size),
            Self::Inline(b) => Some(b.len() as u64),
        }
    }
}

/// One array: metadata, attributes and a reference per chunk, in C order over the chunk grid.
#[derive(Debug, Clone, PartialEq)]
pub struct ArrayRefs {
    pub metadata: ArrayMetadataV2,
    pub attributes: Attributes,
    pub chunks: Vec<ChunkRef>,
}

impl ArrayRefs {
    /// Create an array with every chunk missing.
    pub fn new(metadata: ArrayMetadataV2, attributes: Attributes) -> Self {
        let chunks = vec![ChunkRef::Missing; metadata.num_chunks() as usize];
        Self {
            metadata,
            attributes,
            chunks,
        }
    }

    /// Dimension names from the `_ARRAY_DIMENSIONS` attribute.
    pub fn dimensions(&self) -> Vec<String> {
        self.attributes
            .get(ARRAY_DIMENSIONS)
            .and_then(|v| v.as_array())
            .map(|dims| {
                dims.iter()
                    .filter_map(|d| d.as_str().map(str::to_owned))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Set the reference for the chunk at the given grid indices.
    pub fn set_chunk(&mut self, grid_indices: &[u64], chunk: ChunkRef) -> crate::Result<()> {
        let grid = self.metadata.chunk_grid_shape();
        let idx = ravel(grid_indices, &grid).ok_or_else(|| {
            crate::Error::general(format!(
                "chunk {grid_indices:?} is outside chunk grid {grid:?}"
            ))
        })?;
        self.chunks[idx as usize] = chunk;
        Ok(())
    }

    /// Chunks which are not [ChunkRef::Missing], with their grid indices.
    pub fn present_chunks(&self) -> impl Iterator<Item = (Vec<u64>, &ChunkRef)> {
        let grid = self.metadata.chunk_grid_shape();
        self.chunks
            .iter()
            .enumerate()
            .filter(|(_, c)| !c.is_missing())
            .map(move |(i, c)| (unravel(i as u64, &grid), c))
    }
}

/// Everything a reference store describes.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ReferenceSet {
    /// Group path ("" for the root) to group attributes.
    pub groups: BTreeMap<String, Attributes>,
    /// Array path to array.
    pub arrays: BTreeMap<String, ArrayRefs>,
}

impl ReferenceSet {
    pub fn new() -> Self {
        let mut groups = BTreeMap::new();
        groups.insert(String::new(), Attributes::new());
        Self {
            groups,
            arrays: BTreeMap::new(),
        }
    }

    pub fn root_attributes(&self) -> Option<&Attributes> {
        self.groups.get("")
    }
}

/// C-order linear index of `indices` within `grid`.
pub fn ravel(indices: &[u64], grid: &[u64]) -> Option<u64> {
    if indices.len() != grid.len() {
        return None;
    }
    let mut idx = 0u64;
    for (&i, &g) in indices.iter().zip(grid) {
        if i >= g {
            return None;
        }
        idx = idx * g + i;
    }
    Some(idx)
}

/// Grid indices of the C-order linear index `idx`.
pub fn unravel(mut idx: u64, grid: &[u64]) -> Vec<u64> {
    let mut out = vec![0; grid.len()];
    for (o, &g) in out.iter_mut().zip(grid).rev() {
        *o = idx % g;
        idx /= g;
    }
    out
}

/// Zarr V2 chunk key (relative to the array) for the given grid indices.
pub fn chunk_key(grid_indices: &[u64], separator: &str) -> String {
    if grid_indices.is_empty() {
        return "0".into();
    }
    grid_indices
        .iter()
        .map(u64::to_string)
        .collect::<Vec<_>>()
        .join(separator)
}

/// Inverse of [chunk_key].
pub fn parse_chunk_key(key: &str, separator: &str, ndim: usize) -> Option<Vec<u64>> {
    if ndim == 0 {
        return (key == "0").then(Vec::new);
    }
    let out = key
        .split(separator)
        .map(|s| s.parse().ok())
        .collect::<Option<Vec<u64>>>()?;
    (out.len() == ndim).then_some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ravel_unravel() {
        let grid = [2, 3, 4];
        for i in 0..24 {
            let idx = unravel(i, &grid);
            assert_eq!(ravel(&idx, &grid), Some(i));
        }
        assert_eq!(ravel(&[2, 0, 0], &grid), None);
        assert_eq!(ravel(&[], &[]), Some(0));
    }

    #[test]
    fn chunk_keys() {
        assert_eq!(chunk_key(&[1, 0, 2], "."), "1.0.2");
        assert_eq!(chunk_key(&[], "."), "0");
        assert_eq!(parse_chunk_key("1.0.2", ".", 3), Some(vec![1, 0, 2]));
        assert_eq!(parse_chunk_key("1.0", ".", 3), None);
        assert_eq!(parse_chunk_key("0", ".", 0), Some(vec![]));
        assert_eq!(parse_chunk_key(".zarray", ".", 1), None);
    }

    #[test]
    fn set_chunk_checks_bounds() {
        let meta = ArrayMetadataV2::new(vec![4, 4], vec![2, 2], "<f4");
        let mut arr = ArrayRefs::new(meta, Attributes::new());
        assert_eq!(arr.chunks.len(), 4);
        arr.set_chunk(&[1, 0], ChunkRef::Inline(Bytes::from_static(b"ab")))
            .unwrap();
        assert!(arr.set_chunk(&[2, 0], ChunkRef::Missing).is_err());
        let present: Vec<_> = arr.present_chunks().map(|(i, _)| i).collect();
        assert_eq!(present, vec![vec![1, 0]]);
    }
}
