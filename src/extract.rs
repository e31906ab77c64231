//! Building [ReferenceSet]s from source files.

use std::path::Path;

use crate::Result;
use crate::reference::ReferenceSet;

#[cfg(feature = "hdf5")]
mod h5;

#[cfg(feature = "hdf5")]
pub use h5::Hdf5Extractor;

/// Maps one source file to the references needed to read its chunks in place.
///
/// Implementations are shared between worker threads.
pub trait ReferenceExtractor: Send + Sync {
    fn extract(&self, input: &Path) -> Result<ReferenceSet>;
}

impl<T: ReferenceExtractor + ?Sized> ReferenceExtractor for &T {
    fn extract(&self, input: &Path) -> Result<ReferenceSet> {
        (**self).extract(input)
    }
}

impl<T: ReferenceExtractor + ?Sized> ReferenceExtractor for Box<T> {
    fn extract(&self, input: &Path) -> Result<ReferenceSet> {
        (**self).extract(input)
    }
}

/// The extractor for HDF5/NetCDF-4 files, if this build supports them.
pub fn default_extractor() -> Result<Box<dyn ReferenceExtractor>> {
    #[cfg(feature = "hdf5")]
    {
        Ok(Box::new(Hdf5Extractor))
    }
    #[cfg(not(feature = "hdf5"))]
    {
        Err(crate::Error::general(
            "built without HDF5 support; enable the `hdf5` feature",
        ))
    }
}
