//! Recurring discovery cycles with a single-flight guard.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{json, Value as JsonValue};
use svcdir_core::{CycleRun, FailureReason, IngestTally, Job, JobOutcome, JobReport};
use svcdir_storage::{StatsStore, StoreError};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job as TimerJob, JobScheduler, JobSchedulerError};
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

use crate::batch::BatchScheduler;
use crate::ingest::Ingestor;
use crate::runner::JobRunner;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("a discovery cycle is already running")]
    CycleInProgress,
    #[error("scheduler error: {0}")]
    Scheduler(#[from] JobSchedulerError),
    #[error("stats store error: {0}")]
    Stats(#[from] StoreError),
}

/// What a job produced once its candidates have been ingested.
#[derive(Debug, Clone, Copy)]
struct JobSummary {
    candidates: usize,
    accepted: usize,
    tally: IngestTally,
}

struct Control {
    timer: Option<JobScheduler>,
    cancel: CancellationToken,
}

struct DriverInner {
    jobs: Vec<Job>,
    runner: JobRunner,
    ingestor: Ingestor,
    scheduler: BatchScheduler,
    stats: Arc<dyn StatsStore>,
    interval: Duration,
    cycle: Mutex<()>,
    control: Mutex<Control>,
}

/// Owns the recurring timer and runs cycles over the configured jobs.
///
/// Cheap to clone; clones share the same guard, timer and stores.
#[derive(Clone)]
pub struct CycleDriver {
    inner: Arc<DriverInner>,
}

impl std::fmt::Debug for CycleDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CycleDriver")
            .field("jobs", &self.inner.jobs.len())
            .field("interval", &self.inner.interval)
            .field("scheduler", &self.inner.scheduler)
            .finish_non_exhaustive()
    }
}

impl CycleDriver {
    pub fn new(
        jobs: Vec<Job>,
        runner: JobRunner,
        ingestor: Ingestor,
        scheduler: BatchScheduler,
        stats: Arc<dyn StatsStore>,
        interval: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(DriverInner {
                jobs,
                runner,
                ingestor,
                scheduler,
                stats,
                interval,
                cycle: Mutex::new(()),
                control: Mutex::new(Control {
                    timer: None,
                    cancel: CancellationToken::new(),
                }),
            }),
        }
    }

    pub fn jobs(&self) -> &[Job] {
        &self.inner.jobs
    }

    pub async fn is_running(&self) -> bool {
        self.inner.control.lock().await.timer.is_some()
    }

    /// Starts the recurring timer and kicks off one cycle immediately.
    ///
    /// Calling `start` on a running driver is a no-op.
    pub async fn start(&self) -> Result<(), DriverError> {
        let mut control = self.inner.control.lock().await;
        if control.timer.is_some() {
            warn!("discovery service already running");
            return Ok(());
        }

        let sched = JobScheduler::new().await?;
        let driver = self.clone();
        let timer_job = TimerJob::new_repeated_async(self.inner.interval, move |_uuid, _l| {
            let driver = driver.clone();
            Box::pin(async move {
                driver.tick().await;
            })
        })?;
        sched.add(timer_job).await?;
        sched.start().await?;

        if control.cancel.is_cancelled() {
            control.cancel = CancellationToken::new();
        }
        control.timer = Some(sched);
        drop(control);

        let now = Utc::now();
        self.write_stats(json!({ "status": "started", "startTime": now.to_rfc3339() }))
            .await;
        self.log(&format!(
            "Background discovery service started: {} jobs every {}s, up to {} concurrent",
            self.inner.jobs.len(),
            self.inner.interval.as_secs(),
            self.inner.scheduler.max_concurrent(),
        ))
        .await;
        info!(
            jobs = self.inner.jobs.len(),
            interval_secs = self.inner.interval.as_secs(),
            "discovery service started"
        );

        let driver = self.clone();
        tokio::spawn(async move {
            driver.tick().await;
        });
        Ok(())
    }

    /// Stops the timer and waits for an in-flight cycle to run to completion.
    pub async fn stop(&self) -> Result<(), DriverError> {
        self.halt(false).await
    }

    /// Like [`stop`](Self::stop), but an in-flight cycle ends after its current
    /// batch. Used when the process is asked to terminate.
    pub async fn shutdown(&self) -> Result<(), DriverError> {
        self.halt(true).await
    }

    async fn halt(&self, interrupt: bool) -> Result<(), DriverError> {
        let (timer, cancel) = {
            let mut control = self.inner.control.lock().await;
            (control.timer.take(), control.cancel.clone())
        };
        let was_running = timer.is_some();

        if interrupt {
            cancel.cancel();
        }
        if let Some(mut timer) = timer {
            if let Err(err) = timer.shutdown().await {
                warn!(error = %err, "scheduler shutdown failed");
            }
        }

        let _idle = self.inner.cycle.lock().await;
        if interrupt {
            self.inner.control.lock().await.cancel = CancellationToken::new();
        }

        if was_running {
            self.write_stats(json!({ "status": "stopped", "stopTime": Utc::now().to_rfc3339() }))
                .await;
            self.log("Background discovery service stopped").await;
            info!("discovery service stopped");
        }
        Ok(())
    }

    /// Runs one cycle now, or fails fast if another cycle holds the guard.
    pub async fn run_once(&self) -> Result<CycleRun, DriverError> {
        let _guard = self
            .inner
            .cycle
            .try_lock()
            .map_err(|_| DriverError::CycleInProgress)?;
        Ok(self.execute_cycle().await)
    }

    /// Last persisted stats blob, if any.
    pub async fn get_stats(&self) -> Result<Option<JsonValue>, DriverError> {
        Ok(self.inner.stats.read_stats().await?)
    }

    async fn tick(&self) {
        let Ok(_guard) = self.inner.cycle.try_lock() else {
            info!("cycle still running, skipping tick");
            self.log("Discovery cycle still running, skipping tick").await;
            return;
        };
        if !self.is_running().await {
            return;
        }
        self.execute_cycle().await;
    }

    /// Caller must hold the cycle guard.
    async fn execute_cycle(&self) -> CycleRun {
        let cancel = self.inner.control.lock().await.cancel.clone();
        let run = CycleRun::begin(Utc::now());
        let span = info_span!("cycle", cycle_id = %run.cycle_id);
        self.cycle_body(run, cancel).instrument(span).await
    }

    async fn cycle_body(&self, mut run: CycleRun, cancel: CancellationToken) -> CycleRun {
        let inner = &self.inner;
        info!(jobs = inner.jobs.len(), "starting discovery cycle");
        self.log(&format!(
            "Starting discovery cycle {} ({} jobs)",
            run.cycle_id,
            inner.jobs.len()
        ))
        .await;

        let before = self.count_records().await;

        let batch = inner
            .scheduler
            .run(&inner.jobs, &cancel, |job| {
                let span = info_span!("job", job = %job.name);
                async move { self.process_job(job).await }.instrument(span)
            })
            .await;

        let inserted_this_cycle: usize = batch
            .settled
            .iter()
            .filter_map(|settled| match &settled.outcome {
                JobOutcome::Success(summary) => Some(summary.tally.inserted),
                JobOutcome::Failure(_) => None,
            })
            .sum();

        for settled in batch.settled {
            let duration_ms = u64::try_from(settled.elapsed.as_millis()).unwrap_or(u64::MAX);
            let report = match settled.outcome {
                JobOutcome::Success(summary) => JobReport {
                    job: settled.job,
                    success: true,
                    reason: None,
                    candidates: summary.candidates,
                    accepted: summary.accepted,
                    tally: summary.tally,
                    duration_ms,
                },
                JobOutcome::Failure(reason) => JobReport {
                    job: settled.job,
                    success: false,
                    reason: Some(reason),
                    candidates: 0,
                    accepted: 0,
                    tally: IngestTally::default(),
                    duration_ms,
                },
            };
            self.log(&job_line(&report)).await;
            run.push_job(report);
        }
        run.batches = batch.batches;
        run.interrupted = batch.interrupted;

        let after = self.count_records().await;
        run.total_records = after;
        run.new_records = match (before, after) {
            (Some(before), Some(after)) => after.saturating_sub(before),
            _ => {
                warn!("record count unavailable; reporting inserted records as new");
                inserted_this_cycle as u64
            }
        };
        run.finish(Utc::now());

        info!(
            success = run.success,
            failed = run.failed,
            new_records = run.new_records,
            batches = ?run.batches,
            duration_secs = run.duration_secs,
            interrupted = run.interrupted,
            "discovery cycle finished"
        );

        if run.interrupted {
            self.log(&format!(
                "Discovery cycle {} interrupted after {} of {} jobs",
                run.cycle_id,
                run.jobs.len(),
                inner.jobs.len()
            ))
            .await;
            return run;
        }

        self.log(&format!(
            "Discovery cycle complete: {} succeeded, {} failed, {} new services in {}s",
            run.success, run.failed, run.new_records, run.duration_secs
        ))
        .await;
        for error in &run.errors {
            self.log(&format!("  error: {error}")).await;
        }
        self.write_stats(cycle_stats(&run, run.finished_at)).await;
        run
    }

    async fn process_job(&self, job: Job) -> JobOutcome<JobSummary> {
        let extraction = match self.inner.runner.run(&job).await {
            JobOutcome::Success(extraction) => extraction,
            JobOutcome::Failure(reason) => return JobOutcome::Failure(reason),
        };
        let accepted = extraction.accepted.len();
        match self
            .inner
            .ingestor
            .ingest_all(&job, extraction.accepted, extraction.default_confidence)
            .await
        {
            Ok(tally) => JobOutcome::Success(JobSummary {
                candidates: extraction.candidates,
                accepted,
                tally,
            }),
            Err(err) => JobOutcome::Failure(FailureReason::StorageError(err.to_string())),
        }
    }

    async fn count_records(&self) -> Option<u64> {
        match self.inner.ingestor.store().count().await {
            Ok(count) => Some(count),
            Err(err) => {
                warn!(error = %err, "counting records failed");
                None
            }
        }
    }

    async fn log(&self, line: &str) {
        if let Err(err) = self.inner.stats.append_log(line).await {
            warn!(error = %err, "appending to discovery log failed");
        }
    }

    async fn write_stats(&self, update: JsonValue) {
        if let Err(err) = self.inner.stats.write_stats(update).await {
            warn!(error = %err, "writing discovery stats failed");
        }
    }
}

fn job_line(report: &JobReport) -> String {
    match &report.reason {
        Some(reason) => format!("Job {} failed: {reason}", report.job),
        None => format!(
            "Job {} succeeded: {} candidates, {} accepted, {} inserted, {} updated, {} skipped",
            report.job,
            report.candidates,
            report.accepted,
            report.tally.inserted,
            report.tally.updated,
            report.tally.skipped
        ),
    }
}

fn cycle_stats(run: &CycleRun, last_run: DateTime<Utc>) -> JsonValue {
    json!({
        "lastRun": last_run.to_rfc3339(),
        "duration": run.duration_secs,
        "results": {
            "cycleId": run.cycle_id,
            "success": run.success,
            "failed": run.failed,
            "newServices": run.new_records,
            "inserted": run.inserted,
            "updated": run.updated,
            "skipped": run.skipped,
            "rejected": run.rejected,
            "batches": run.batches,
            "errors": run.errors,
            "jobs": run.jobs,
        },
        "totalServices": run.total_records,
    })
}
