//! Creating reference stores for every matching file in a directory.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::discover::{EntryKind, discover};
use crate::error::IoResultExt;
use crate::extract::ReferenceExtractor;
use crate::job::{self, DEFAULT_RECORD_SIZE, JobOutcome, JobRecord};
use crate::pool::WorkerPool;
use crate::store::store_path_for;
use crate::Result;

pub const DEFAULT_SOURCE_PATTERN: &str = "*.nc";
pub const DEFAULT_WORKERS: usize = 4;

#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub output_directory: PathBuf,
    pub pattern: String,
    pub record_size: u64,
    pub workers: usize,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            output_directory: PathBuf::from("."),
            pattern: DEFAULT_SOURCE_PATTERN.into(),
            record_size: DEFAULT_RECORD_SIZE,
            workers: DEFAULT_WORKERS,
        }
    }
}

/// The inputs a batch would process and the stores it would create.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchPlan {
    pub inputs: Vec<PathBuf>,
    pub outputs: Vec<PathBuf>,
}

/// Discover inputs without touching the output directory.
pub fn plan(source_directory: &Path, options: &BatchOptions) -> Result<BatchPlan> {
    let inputs = discover(source_directory, &options.pattern, EntryKind::File)?;
    let outputs = inputs
        .iter()
        .map(|i| store_path_for(i, &options.output_directory))
        .collect::<Result<_>>()?;
    Ok(BatchPlan { inputs, outputs })
}

/// What [run_all] would do: one summary line, then one line per input.
pub fn describe(source_directory: &Path, options: &BatchOptions) -> Result<String> {
    let plan = plan(source_directory, options)?;
    let mut out = format!(
        "Would create {} reference stores in {} from files in {} matching {}, with {} workers",
        plan.inputs.len(),
        options.output_directory.display(),
        source_directory.display(),
        options.pattern,
        options.workers
    );
    for (input, output) in plan.inputs.iter().zip(&plan.outputs) {
        out.push_str(&format!("\n  {} -> {}", input.display(), output.display()));
    }
    Ok(out)
}

/// Job records of one batch, in discovery order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub records: Vec<JobRecord>,
}

impl BatchReport {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn succeeded(&self) -> impl Iterator<Item = &JobRecord> {
        self.records.iter().filter(|r| r.succeeded())
    }

    pub fn failed(&self) -> impl Iterator<Item = &JobRecord> {
        self.records.iter().filter(|r| !r.succeeded())
    }

    pub fn has_failures(&self) -> bool {
        self.failed().next().is_some()
    }
}

/// Create a reference store for every file in `source_directory` matching the pattern.
///
/// Jobs run on a pool of `options.workers` threads.
/// A failing job does not stop the others; check [BatchReport::failed].
/// If nothing matches, nothing is created.
pub fn run_all(
    extractor: &dyn ReferenceExtractor,
    source_directory: &Path,
    options: &BatchOptions,
) -> Result<BatchReport> {
    let BatchPlan { inputs, outputs } = plan(source_directory, options)?;
    if inputs.is_empty() {
        println!(
            "No files found in {} matching {}",
            source_directory.display(),
            options.pattern
        );
        return Ok(BatchReport::default());
    }
    let pool = WorkerPool::new(options.workers)?;
    fs::create_dir_all(&options.output_directory).at(&options.output_directory)?;
    log::info!(
        "Creating references for {} files with {} workers",
        inputs.len(),
        pool.workers()
    );

    // inputs sharing a stem would write to the same store
    let mut first_for_output: HashMap<&Path, &Path> = HashMap::new();
    let mut collisions: HashMap<usize, String> = HashMap::new();
    for (idx, (input, output)) in inputs.iter().zip(&outputs).enumerate() {
        if let Some(first) = first_for_output.insert(output, input) {
            first_for_output.insert(output, first);
            collisions.insert(
                idx,
                format!(
                    "{} would overwrite the references to {}",
                    output.display(),
                    first.display()
                ),
            );
        }
    }
    for message in collisions.values() {
        log::error!("{message}");
    }

    let to_run: Vec<&Path> = inputs
        .iter()
        .enumerate()
        .filter(|(idx, _)| !collisions.contains_key(idx))
        .map(|(_, i)| i.as_path())
        .collect();
    let mut results = pool
        .run(to_run, |input| {
            job::run(extractor, input, &options.output_directory, options.record_size)
        })
        .into_iter();

    let mut records = Vec::with_capacity(inputs.len());
    for (idx, (input, output)) in inputs.into_iter().zip(outputs).enumerate() {
        let outcome = match collisions.remove(&idx) {
            Some(message) => JobOutcome::Failed(message),
            None => match results.next() {
                Some(Ok(_)) => JobOutcome::Succeeded,
                Some(Err(e)) => JobOutcome::Failed(e.to_string()),
                None => JobOutcome::Failed("job was not run".into()),
            },
        };
        records.push(JobRecord {
            input,
            output,
            record_size: options.record_size,
            outcome,
        });
    }
    let report = BatchReport { records };
    log::info!(
        "Batch finished: {} succeeded, {} failed",
        report.succeeded().count(),
        report.failed().count()
    );
    Ok(report)
}
