//! The `zarrs-kerchunk` command line tool.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use zarrs_kerchunk::batch::{self, BatchOptions, DEFAULT_SOURCE_PATTERN, DEFAULT_WORKERS};
use zarrs_kerchunk::combine::{self, DEFAULT_STORE_PATTERN};
use zarrs_kerchunk::extract::default_extractor;
use zarrs_kerchunk::job::{self, DEFAULT_RECORD_SIZE, JobOutcome};
use zarrs_kerchunk::{Error, Result, inspect, logging};

/// Create, combine and inspect kerchunk-style reference stores for HDF5/NetCDF4 files.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Also log progress to stderr.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a reference store for a single file.
    Reference {
        input_file: PathBuf,
        #[arg(long, default_value = ".")]
        output_directory: PathBuf,
        /// Chunk references per partition file.
        #[arg(long, default_value_t = DEFAULT_RECORD_SIZE)]
        record_size: u64,
        /// Print what would be done, without writing anything.
        #[arg(long)]
        dry_run: bool,
    },
    /// Create a reference store for every matching file in a directory.
    ReferenceMulti {
        source_directory: PathBuf,
        #[arg(long, default_value = ".")]
        output_directory: PathBuf,
        /// Glob pattern for file names within the source directory.
        #[arg(long, default_value = DEFAULT_SOURCE_PATTERN)]
        pattern: String,
        #[arg(long, default_value_t = DEFAULT_RECORD_SIZE)]
        record_size: u64,
        /// Number of files processed at once.
        #[arg(long, default_value_t = DEFAULT_WORKERS)]
        workers: usize,
        #[arg(long)]
        dry_run: bool,
    },
    /// Combine reference stores into one, concatenated along time.
    CombineStores {
        source_directory: PathBuf,
        /// `.parquet` is appended if missing.
        output_parquet_store: PathBuf,
        #[arg(long, default_value = DEFAULT_STORE_PATTERN)]
        pattern: String,
        #[arg(long, default_value_t = DEFAULT_RECORD_SIZE)]
        record_size: u64,
    },
    /// Print a summary of a reference store.
    Select { parquet_store: PathBuf },
}

impl Command {
    fn is_dry_run(&self) -> bool {
        match self {
            Self::Reference { dry_run, .. } | Self::ReferenceMulti { dry_run, .. } => *dry_run,
            _ => false,
        }
    }
}

/// An error, and whether it has already been shown to the user.
enum Failure {
    Reported(Error),
    Unreported(Error),
}

impl From<Error> for Failure {
    fn from(e: Error) -> Self {
        Self::Unreported(e)
    }
}

fn reference_multi(
    source_directory: &Path,
    options: &BatchOptions,
    dry_run: bool,
) -> Result<(), Failure> {
    if dry_run {
        println!("{}", batch::describe(source_directory, options)?);
        return Ok(());
    }

    let extractor = default_extractor()?;
    let report = batch::run_all(&extractor, source_directory, options)?;
    if report.has_failures() {
        eprintln!("Failed to create references for:");
        for record in report.failed() {
            if let JobOutcome::Failed(message) = &record.outcome {
                eprintln!("  {}: {message}", record.input.display());
            }
        }
        let failed = report.failed().count();
        return Err(Failure::Reported(Error::Extraction {
            path: source_directory.to_owned(),
            message: format!("{failed} of {} files failed", report.records.len()),
        }));
    }
    Ok(())
}

fn run(command: Command) -> Result<(), Failure> {
    match command {
        Command::Reference {
            input_file,
            output_directory,
            record_size,
            dry_run,
        } => {
            if dry_run {
                println!(
                    "{}",
                    job::describe(&input_file, &output_directory, record_size)?
                );
                return Ok(());
            }
            let extractor = default_extractor()?;
            job::run(&extractor, &input_file, &output_directory, record_size)
                .map_err(Failure::Reported)?;
        }
        Command::ReferenceMulti {
            source_directory,
            output_directory,
            pattern,
            record_size,
            workers,
            dry_run,
        } => {
            let options = BatchOptions {
                output_directory,
                pattern,
                record_size,
                workers,
            };
            reference_multi(&source_directory, &options, dry_run)?;
        }
        Command::CombineStores {
            source_directory,
            output_parquet_store,
            pattern,
            record_size,
        } => {
            combine::combine(
                &source_directory,
                &output_parquet_store,
                &pattern,
                record_size,
            )
            .map_err(Failure::Reported)?;
        }
        Command::Select { parquet_store } => {
            let summary = inspect::summarize(&parquet_store)?;
            print!("{summary}");
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_file = logging::log_file_for(cli.command.is_dry_run());
    if let Err(e) = logging::init(cli.verbose, log_file) {
        eprintln!("Could not set up logging: {e}");
    }
    log::debug!("{cli:?}");

    match run(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(Failure::Reported(e)) => ExitCode::from(e.exit_code() as u8),
        Err(Failure::Unreported(e)) => {
            log::error!("{e:?}");
            eprintln!("Error: {e}");
            ExitCode::from(e.exit_code() as u8)
        }
    }
}
