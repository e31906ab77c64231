//! Error type and process exit codes.

use std::path::{Path, PathBuf};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0}")]
    General(String),
    #[error("could not create references for {path}: {message}")]
    Extraction { path: PathBuf, message: String },
    #[error("could not combine references into {path}: {message}")]
    Merge { path: PathBuf, message: String },
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),
    #[error(transparent)]
    Parquet(#[from] parquet::errors::ParquetError),
    #[error(transparent)]
    Arrow(#[from] arrow_schema::ArrowError),
    #[error(transparent)]
    Pattern(#[from] glob::PatternError),
    #[cfg(feature = "hdf5")]
    #[error(transparent)]
    Hdf5(#[from] hdf5::Error),
    #[error(transparent)]
    Wrapped(Box<dyn std::error::Error + Send + Sync>),
}

/// Coarse classification of an [Error], used for process exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Extraction,
    Merge,
    Io,
    Other,
}

impl Error {
    pub fn general(message: impl Into<String>) -> Self {
        Self::General(message.into())
    }

    pub fn wrap(error: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Wrapped(Box::new(error))
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Wrap any non-IO error as a failure to extract references from `path`.
    pub fn into_extraction(self, path: &Path) -> Self {
        match self {
            e @ (Self::Io { .. } | Self::Extraction { .. }) => e,
            e => Self::Extraction {
                path: path.to_owned(),
                message: e.to_string(),
            },
        }
    }

    /// Wrap any non-IO error as a failure to build the combined store at `path`.
    pub fn into_merge(self, path: &Path) -> Self {
        match self {
            e @ (Self::Io { .. } | Self::Merge { .. }) => e,
            e => Self::Merge {
                path: path.to_owned(),
                message: e.to_string(),
            },
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Extraction { .. } => ErrorKind::Extraction,
            Self::Merge { .. } => ErrorKind::Merge,
            Self::Io { .. } => ErrorKind::Io,
            _ => ErrorKind::Other,
        }
    }

    /// Process exit code for this error.
    ///
    /// 2 is left to clap for usage errors.
    pub fn exit_code(&self) -> i32 {
        match self.kind() {
            ErrorKind::Other => 1,
            ErrorKind::Extraction => 3,
            ErrorKind::Merge => 4,
            ErrorKind::Io => 5,
        }
    }
}

/// Attach a path to IO errors.
pub(crate) trait IoResultExt<T> {
    fn at(self, path: &Path) -> Result<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn at(self, path: &Path) -> Result<T> {
        self.map_err(|e| Error::io(path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_keep_their_kind_when_wrapped() {
        let e = Error::io("/nope", std::io::Error::from(std::io::ErrorKind::NotFound));
        assert_eq!(e.into_extraction(Path::new("a.nc")).kind(), ErrorKind::Io);
    }

    #[test]
    fn other_errors_become_merge_failures() {
        let e = Error::general("bad chunking").into_merge(Path::new("out.parquet"));
        assert_eq!(e.kind(), ErrorKind::Merge);
        assert_eq!(e.exit_code(), 4);
        assert!(e.to_string().contains("bad chunking"));
    }
}
