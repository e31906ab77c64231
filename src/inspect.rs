//! Summaries of reference stores, read back through zarrs.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use zarrs::array::Array;

use crate::metadata::{Attributes, ScalarKind, ScalarType};
use crate::storage::ReferenceStore;
use crate::{Error, Result};

/// Coordinate values shown at each end when a coordinate is long.
const EDGE_VALUES: usize = 3;

#[derive(Debug, Clone, PartialEq)]
pub struct VariableSummary {
    /// Path of the array within the store.
    pub name: String,
    pub dimensions: Vec<String>,
    pub shape: Vec<u64>,
    pub dtype: String,
    /// Decoded values, for coordinates which could be read.
    pub values: Option<Vec<f64>>,
}

/// Dimensions, coordinates, data variables and attributes of a store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreSummary {
    pub path: PathBuf,
    /// Dimension names and lengths, in order of first appearance.
    pub dimensions: Vec<(String, u64)>,
    pub coordinates: Vec<VariableSummary>,
    pub data_variables: Vec<VariableSummary>,
    pub attributes: Attributes,
}

impl StoreSummary {
    pub fn dimension(&self, name: &str) -> Option<u64> {
        self.dimensions
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, len)| *len)
    }

    pub fn coordinate(&self, name: &str) -> Option<&VariableSummary> {
        self.coordinates.iter().find(|c| c.name == name)
    }
}

/// Open the reference store at `path` as a zarr hierarchy and summarise it.
pub fn summarize(path: &Path) -> Result<StoreSummary> {
    let store = Arc::new(ReferenceStore::open(path)?);
    let refs = store.references();

    let mut dimensions: Vec<(String, u64)> = Vec::new();
    let mut coordinates = Vec::new();
    let mut data_variables = Vec::new();
    for (name, arr) in &refs.arrays {
        let array = Array::open(store.clone(), &format!("/{name}"))
            .map_err(|e| Error::general(format!("cannot open array {name}: {e}")))?;
        let shape = array.shape().to_vec();
        let dims = arr.dimensions();
        for (dim, len) in dims.iter().zip(&shape) {
            if !dimensions.iter().any(|(d, _)| d == dim) {
                dimensions.push((dim.clone(), *len));
            }
        }
        let data_type = arr.metadata.data_type()?;
        let leaf = name.rsplit('/').next().unwrap_or(name);
        let is_coordinate = dims.len() == 1 && dims[0] == leaf;

        let values = if is_coordinate {
            match read_values(&array, data_type) {
                Ok(v) => Some(v),
                Err(e) => {
                    log::warn!("Could not read coordinate {name}: {e}");
                    None
                }
            }
        } else {
            None
        };
        let summary = VariableSummary {
            name: name.clone(),
            dimensions: dims,
            shape,
            dtype: data_type.name(),
            values,
        };
        if is_coordinate {
            coordinates.push(summary);
        } else {
            data_variables.push(summary);
        }
    }

    Ok(StoreSummary {
        path: path.to_owned(),
        dimensions,
        coordinates,
        data_variables,
        attributes: refs.root_attributes().cloned().unwrap_or_default(),
    })
}

/// Decode a whole array to floats.
pub fn read_values(array: &Array<ReferenceStore>, data_type: ScalarType) -> Result<Vec<f64>> {
    macro_rules! retrieve {
        ($t:ty) => {{
            let v: Vec<$t> = array
                .retrieve_array_subset(&array.subset_all())
                .map_err(|e| Error::general(e.to_string()))?;
            v.into_iter().map(|x| x as f64).collect()
        }};
    }
    let values = match (data_type.kind, data_type.size) {
        (ScalarKind::Float, 4) => retrieve!(f32),
        (ScalarKind::Float, 8) => retrieve!(f64),
        (ScalarKind::Int, 1) => retrieve!(i8),
        (ScalarKind::Int, 2) => retrieve!(i16),
        (ScalarKind::Int, 4) => retrieve!(i32),
        (ScalarKind::Int, 8) => retrieve!(i64),
        (ScalarKind::UInt, 1) => retrieve!(u8),
        (ScalarKind::UInt, 2) => retrieve!(u16),
        (ScalarKind::UInt, 4) => retrieve!(u32),
        (ScalarKind::UInt, 8) => retrieve!(u64),
        _ => {
            return Err(Error::general(format!(
                "cannot decode {} values",
                data_type.name()
            )));
        }
    };
    Ok(values)
}

fn write_values(f: &mut fmt::Formatter<'_>, values: &[f64]) -> fmt::Result {
    if values.len() <= 2 * EDGE_VALUES {
        for v in values {
            write!(f, " {v}")?;
        }
        return Ok(());
    }
    for v in &values[..EDGE_VALUES] {
        write!(f, " {v}")?;
    }
    write!(f, " ...")?;
    for v in &values[values.len() - EDGE_VALUES..] {
        write!(f, " {v}")?;
    }
    Ok(())
}

fn write_variable(f: &mut fmt::Formatter<'_>, marker: char, v: &VariableSummary) -> fmt::Result {
    write!(
        f,
        "  {marker} {:<12} ({}) {}",
        v.name,
        v.dimensions.join(", "),
        v.dtype
    )?;
    match &v.values {
        Some(values) => write_values(f, values)?,
        None => write!(f, " ...")?,
    }
    writeln!(f)
}

impl fmt::Display for StoreSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "<reference store> {}", self.path.display())?;
        let dims: Vec<String> = self
            .dimensions
            .iter()
            .map(|(d, n)| format!("{d}: {n}"))
            .collect();
        writeln!(f, "Dimensions:  ({})", dims.join(", "))?;
        writeln!(f, "Coordinates:")?;
        for c in &self.coordinates {
            write_variable(f, '*', c)?;
        }
        writeln!(f, "Data variables:")?;
        for v in &self.data_variables {
            write_variable(f, ' ', v)?;
        }
        if !self.attributes.is_empty() {
            writeln!(f, "Attributes:")?;
            for (k, v) in &self.attributes {
                match v.as_str() {
                    Some(s) => writeln!(f, "    {k}: {s}")?,
                    None => writeln!(f, "    {k}: {v}")?,
                }
            }
        }
        Ok(())
    }
}
