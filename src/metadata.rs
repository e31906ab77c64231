//! Zarr V2 metadata documents (`.zarray`, `.zgroup`, `.zmetadata`) and numpy dtypes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Attribute name holding the dimension names of an array, as understood by xarray.
pub const ARRAY_DIMENSIONS: &str = "_ARRAY_DIMENSIONS";

pub type Attributes = serde_json::Map<String, serde_json::Value>;

/// Zarr V2 group metadata (`.zgroup`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GroupMetadataV2 {
    pub zarr_format: u8,
}

impl Default for GroupMetadataV2 {
    fn default() -> Self {
        Self { zarr_format: 2 }
    }
}

/// Zarr V2 array metadata (`.zarray`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArrayMetadataV2 {
    pub zarr_format: u8,
    pub shape: Vec<u64>,
    /// For zero-length dimensions this is 1, as zarr does not allow empty chunks.
    pub chunks: Vec<u64>,
    /// Numpy-style type string, e.g. `<f4`.
    pub dtype: String,
    pub compressor: Option<CodecV2>,
    pub fill_value: serde_json::Value,
    pub order: String,
    pub filters: Option<Vec<CodecV2>>,
    #[serde(default = "default_dimension_separator")]
    pub dimension_separator: String,
}

fn default_dimension_separator() -> String {
    ".".into()
}

impl ArrayMetadataV2 {
    pub fn new(shape: Vec<u64>, chunks: Vec<u64>, dtype: impl Into<String>) -> Self {
        Self {
            zarr_format: 2,
            shape,
            chunks,
            dtype: dtype.into(),
            compressor: None,
            fill_value: serde_json::Value::from(0),
            order: "C".into(),
            filters: None,
            dimension_separator: default_dimension_separator(),
        }
    }

    pub fn with_compressor(mut self, compressor: Option<CodecV2>) -> Self {
        self.compressor = compressor;
        self
    }

    pub fn with_filters(mut self, filters: Vec<CodecV2>) -> Self {
        self.filters = if filters.is_empty() {
            None
        } else {
            Some(filters)
        };
        self
    }

    pub fn with_fill_value(mut self, fill_value: serde_json::Value) -> Self {
        self.fill_value = fill_value;
        self
    }

    /// Number of chunks along each dimension.
    pub fn chunk_grid_shape(&self) -> Vec<u64> {
        self.shape
            .iter()
            .zip(self.chunks.iter())
            .map(|(&s, &c)| s.div_ceil(c.max(1)))
            .collect()
    }

    /// Total number of chunks; 1 for scalars.
    pub fn num_chunks(&self) -> u64 {
        self.chunk_grid_shape().iter().product()
    }

    /// Check that the chunk shape has one extent of at least 1 per dimension.
    pub fn validate(&self) -> crate::Result<()> {
        if self.chunks.len() != self.shape.len() {
            return Err(crate::Error::general(format!(
                "chunk shape {:?} does not match array shape {:?}",
                self.chunks, self.shape
            )));
        }
        if self.chunks.contains(&0) {
            return Err(crate::Error::general(format!(
                "chunk shape {:?} has an empty extent",
                self.chunks
            )));
        }
        Ok(())
    }

    pub fn data_type(&self) -> crate::Result<ScalarType> {
        ScalarType::parse(&self.dtype)
    }

    /// Whether decoding the chunks requires any codec.
    pub fn is_uncompressed(&self) -> bool {
        self.compressor.is_none() && self.filters.as_ref().is_none_or(Vec::is_empty)
    }
}

/// Numcodecs codec configuration, as used in `.zarray`.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(tag = "id", rename_all = "lowercase")]
pub enum CodecV2 {
    /// HDF5 deflate; a zlib stream.
    Zlib { level: u32 },
    /// HDF5 byte shuffle.
    Shuffle { elementsize: u32 },
}

/// Fixed-size numeric element type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScalarType {
    pub kind: ScalarKind,
    pub size: usize,
    pub big_endian: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarKind {
    Bool,
    Int,
    UInt,
    Float,
}

impl ScalarType {
    pub fn new(kind: ScalarKind, size: usize, big_endian: bool) -> Self {
        // single bytes have no byte order
        let big_endian = big_endian && size > 1;
        Self {
            kind,
            size,
            big_endian,
        }
    }

    /// Parse a numpy type string such as `<f8`, `>i2` or `|u1`.
    pub fn parse(dtype: &str) -> crate::Result<Self> {
        let err = || crate::Error::general(format!("unsupported dtype: {dtype}"));
        let mut chars = dtype.chars();
        let order = chars.next().ok_or_else(err)?;
        let kind = chars.next().ok_or_else(err)?;
        let size: usize = chars.as_str().parse().map_err(|_| err())?;
        let big_endian = match order {
            '<' | '|' => false,
            '>' => true,
            _ => return Err(err()),
        };
        let kind = match (kind, size) {
            ('b', 1) => ScalarKind::Bool,
            ('i', 1 | 2 | 4 | 8) => ScalarKind::Int,
            ('u', 1 | 2 | 4 | 8) => ScalarKind::UInt,
            ('f', 4 | 8) => ScalarKind::Float,
            _ => return Err(err()),
        };
        Ok(Self::new(kind, size, big_endian))
    }

    pub fn dtype(&self) -> String {
        let order = if self.size == 1 {
            '|'
        } else if self.big_endian {
            '>'
        } else {
            '<'
        };
        let kind = match self.kind {
            ScalarKind::Bool => 'b',
            ScalarKind::Int => 'i',
            ScalarKind::UInt => 'u',
            ScalarKind::Float => 'f',
        };
        format!("{order}{kind}{}", self.size)
    }

    /// Short name as printed by numpy, e.g. `float32`.
    pub fn name(&self) -> String {
        match self.kind {
            ScalarKind::Bool => "bool".into(),
            ScalarKind::Int => format!("int{}", self.size * 8),
            ScalarKind::UInt => format!("uint{}", self.size * 8),
            ScalarKind::Float => format!("float{}", self.size * 8),
        }
    }

    /// Decode raw element bytes into floats.
    pub fn decode_f64(&self, bytes: &[u8]) -> crate::Result<Vec<f64>> {
        if bytes.len() % self.size != 0 {
            return Err(crate::Error::general(format!(
                "{} bytes is not a whole number of {} elements",
                bytes.len(),
                self.dtype()
            )));
        }
        let out = bytes
            .chunks_exact(self.size)
            .map(|el| {
                let mut buf = [0u8; 8];
                buf[..self.size].copy_from_slice(el);
                if self.big_endian {
                    buf[..self.size].reverse();
                }
                match (self.kind, self.size) {
                    (ScalarKind::Float, 4) => {
                        f32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as f64
                    }
                    (ScalarKind::Float, _) => f64::from_le_bytes(buf),
                    (ScalarKind::Int, n) => {
                        // sign-extend from the element width
                        let shift = 64 - 8 * n as u32;
                        ((i64::from_le_bytes(buf) << shift) >> shift) as f64
                    }
                    (ScalarKind::UInt | ScalarKind::Bool, _) => u64::from_le_bytes(buf) as f64,
                }
            })
            .collect();
        Ok(out)
    }
}

/// The `.zmetadata` document of a reference store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConsolidatedMetadata {
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub record_size: u64,
}
