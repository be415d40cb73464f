//! Bounded-concurrency batch execution with pacing between batches.

use std::future::Future;
use std::time::Duration;

use futures::future::join_all;
use svcdir_core::{Job, JobOutcome};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// A job that has settled, successfully or not.
#[derive(Debug, Clone, PartialEq)]
pub struct SettledJob<T> {
    pub job: String,
    pub outcome: JobOutcome<T>,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchRun<T> {
    /// Outcomes in job order.
    pub settled: Vec<SettledJob<T>>,
    /// Size of each batch that actually ran.
    pub batches: Vec<usize>,
    /// Cancellation stopped the run before every batch started.
    pub interrupted: bool,
}

/// Runs jobs in consecutive batches of at most `max_concurrent`.
///
/// Every job in a batch settles before the next batch starts, and batches are
/// separated by `pacing` (no delay after the last one). A failed job never
/// affects its siblings.
#[derive(Debug, Clone, Copy)]
pub struct BatchScheduler {
    max_concurrent: usize,
    pacing: Duration,
}

impl BatchScheduler {
    pub fn new(max_concurrent: usize, pacing: Duration) -> Self {
        Self {
            max_concurrent: max_concurrent.max(1),
            pacing,
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Cancellation is checked before each batch and interrupts the pacing wait;
    /// a batch that has started always runs to completion.
    pub async fn run<T, F, Fut>(
        &self,
        jobs: &[Job],
        cancel: &CancellationToken,
        run_job: F,
    ) -> BatchRun<T>
    where
        F: Fn(Job) -> Fut,
        Fut: Future<Output = JobOutcome<T>>,
    {
        let total = jobs.len().div_ceil(self.max_concurrent);
        let mut run = BatchRun {
            settled: Vec::with_capacity(jobs.len()),
            batches: Vec::with_capacity(total),
            interrupted: false,
        };

        for (index, chunk) in jobs.chunks(self.max_concurrent).enumerate() {
            if index > 0 && !self.pacing.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(self.pacing) => {}
                }
            }
            if cancel.is_cancelled() {
                info!(completed = index, total, "batch run interrupted");
                run.interrupted = true;
                break;
            }

            info!(batch = index + 1, total, size = chunk.len(), "starting batch");
            let settled = join_all(chunk.iter().cloned().map(|job| {
                let name = job.name.clone();
                let pending = run_job(job);
                async move {
                    let started = Instant::now();
                    let outcome = pending.await;
                    SettledJob {
                        job: name,
                        outcome,
                        elapsed: started.elapsed(),
                    }
                }
            }))
            .await;

            run.batches.push(chunk.len());
            run.settled.extend(settled);
        }

        run
    }
}
