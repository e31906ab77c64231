//! A bounded pool of worker threads for independent jobs.

use std::panic::{AssertUnwindSafe, catch_unwind};

use rayon::prelude::*;

use crate::{Error, Result};

/// Runs jobs on a fixed number of threads.
///
/// Each worker runs one job to completion before taking the next.
/// A pool of one runs every job in dispatch order.
pub struct WorkerPool {
    pool: rayon::ThreadPool,
    workers: usize,
}

impl WorkerPool {
    pub fn new(workers: usize) -> Result<Self> {
        if workers == 0 {
            return Err(Error::general("at least one worker is required"));
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("reference-worker-{i}"))
            .build()
            .map_err(|e| Error::general(format!("failed to build thread pool: {e}")))?;
        Ok(Self { pool, workers })
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Run `f` on every job and wait for all of them.
    ///
    /// Results are in the same order as `jobs`, whatever order the jobs finish in.
    /// A panicking job yields an error for that job only.
    pub fn run<J, R, F>(&self, jobs: Vec<J>, f: F) -> Vec<Result<R>>
    where
        J: Send,
        R: Send,
        F: Fn(J) -> Result<R> + Sync,
    {
        let run_one = |job: J| {
            catch_unwind(AssertUnwindSafe(|| f(job))).unwrap_or_else(|panic| {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".into());
                Err(Error::general(format!("job panicked: {message}")))
            })
        };
        self.pool.install(|| {
            // one job per rayon task, so no worker holds a batch of jobs
            jobs.into_par_iter()
                .with_max_len(1)
                .map(run_one)
                .collect()
        })
    }
}
