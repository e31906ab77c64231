//! Process-wide logging: a debug log file, plus stderr when verbose.

use std::fs::OpenOptions;
use std::path::Path;

use env_logger::{Builder, Logger, Target, WriteStyle};
use log::{LevelFilter, Log, Metadata, Record};

use crate::error::IoResultExt;
use crate::{Error, Result};

/// Debug log, written to the working directory.
pub const LOG_FILE: &str = "zarrs_kerchunk.log";

/// Sends each record to every logger whose filter accepts it.
struct Tee {
    loggers: Vec<Logger>,
}

impl Log for Tee {
    fn enabled(&self, metadata: &Metadata) -> bool {
        self.loggers.iter().any(|l| l.enabled(metadata))
    }

    fn log(&self, record: &Record) {
        for logger in &self.loggers {
            if logger.matches(record) {
                logger.log(record);
            }
        }
    }

    fn flush(&self) {
        for logger in &self.loggers {
            logger.flush();
        }
    }
}

/// Log file for a command: dry runs write nothing, not even a log.
pub fn log_file_for(dry_run: bool) -> Option<&'static Path> {
    (!dry_run).then_some(Path::new(LOG_FILE))
}

fn tee(verbose: bool, log_file: Option<&Path>) -> Result<Tee> {
    let mut loggers = Vec::new();
    if let Some(path) = log_file {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .at(path)?;
        loggers.push(
            Builder::new()
                .filter_level(LevelFilter::Debug)
                .parse_default_env()
                .target(Target::Pipe(Box::new(file)))
                .write_style(WriteStyle::Never)
                .format_timestamp_millis()
                .build(),
        );
    }
    if verbose {
        loggers.push(
            Builder::new()
                .filter_level(LevelFilter::Info)
                .parse_default_env()
                .target(Target::Stderr)
                .build(),
        );
    }
    Ok(Tee { loggers })
}

/// Install the global logger.
///
/// Debug records and above are appended to `log_file`, usually [LOG_FILE];
/// with `verbose`, info records and above are also written to stderr.
/// `RUST_LOG` overrides both filters.
pub fn init(verbose: bool, log_file: Option<&Path>) -> Result<()> {
    let logger = tee(verbose, log_file)?;
    let max_level = logger
        .loggers
        .iter()
        .map(Logger::filter)
        .max()
        .unwrap_or(LevelFilter::Off);

    log::set_boxed_logger(Box::new(logger)).map_err(Error::wrap)?;
    log::set_max_level(max_level);
    log::debug!(
        "{} {}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dry_runs_have_no_log_file() {
        assert_eq!(log_file_for(true), None);
        assert_eq!(log_file_for(false), Some(Path::new(LOG_FILE)));
    }

    #[test]
    fn log_file_is_only_opened_when_given() {
        let dir = tempfile::tempdir().unwrap();
        let quiet = tee(false, None).unwrap();
        assert!(quiet.loggers.is_empty());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);

        let path = dir.path().join(LOG_FILE);
        let logged = tee(true, Some(&path)).unwrap();
        assert_eq!(logged.loggers.len(), 2);
        assert!(path.is_file());
    }
}
