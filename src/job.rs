//! Creating the reference store for a single source file.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::IoResultExt;
use crate::extract::ReferenceExtractor;
use crate::store::{store_path_for, write_store};
use crate::{Error, Result};

/// Default number of chunk references per partition file.
pub const DEFAULT_RECORD_SIZE: u64 = 10_000;

/// Outcome of one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Succeeded,
    Failed(String),
}

/// What happened to one input file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRecord {
    pub input: PathBuf,
    pub output: PathBuf,
    pub record_size: u64,
    pub outcome: JobOutcome,
}

impl JobRecord {
    pub fn succeeded(&self) -> bool {
        self.outcome == JobOutcome::Succeeded
    }
}

/// What [run] would do, without reading `input` or writing anything.
pub fn describe(input: &Path, output_directory: &Path, record_size: u64) -> Result<String> {
    Ok(format!(
        "Would create {} from {} with {record_size} references per partition",
        store_path_for(input, output_directory)?.display(),
        input.display()
    ))
}

/// Create the reference store for `input` in `output_directory`.
///
/// The store is named after the stem of `input`.
/// Failures are logged and reported on stderr before being returned.
pub fn run(
    extractor: &dyn ReferenceExtractor,
    input: &Path,
    output_directory: &Path,
    record_size: u64,
) -> Result<PathBuf> {
    let output = store_path_for(input, output_directory)?;
    log::info!(
        "Creating references to {} in {}",
        input.display(),
        output.display()
    );
    match build(extractor, input, output_directory, &output, record_size) {
        Ok(()) => {
            log::info!("Created {}", output.display());
            Ok(output)
        }
        Err(e) => {
            let e = e.into_extraction(input);
            log::error!("{e:?}");
            eprintln!("Failed creating references for {}: {e}", input.display());
            Err(e)
        }
    }
}

fn build(
    extractor: &dyn ReferenceExtractor,
    input: &Path,
    output_directory: &Path,
    output: &Path,
    record_size: u64,
) -> Result<()> {
    if record_size == 0 {
        return Err(Error::general("record size must be at least 1"));
    }
    if !input.is_file() {
        return Err(Error::io(
            input,
            std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
        ));
    }
    fs::create_dir_all(output_directory).at(output_directory)?;
    let refs = extractor.extract(input)?;
    write_store(&refs, output, record_size)
}
