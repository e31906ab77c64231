//! Kerchunk-style reference stores for HDF5/NetCDF4 files.
//!
//! A reference store records where each chunk of each dataset lives in the original file,
//! so the data can be read as a zarr V2 hierarchy without being copied.
//! Stores from many files can be combined along a dimension,
//! and read back with [zarrs] through [storage::ReferenceStore].
pub mod batch;
pub mod cftime;
pub mod combine;
pub mod discover;
mod error;
pub mod extract;
pub mod inspect;
pub mod job;
pub mod logging;
pub mod metadata;
pub mod pool;
pub mod reference;
pub mod storage;
pub mod store;

pub use zarrs;

pub use error::{Error, ErrorKind, Result};
