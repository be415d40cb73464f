//! Discovery orchestration: configuration, retry, validation, batching,
//! ingestion and the recurring cycle driver.

use std::sync::Arc;

use anyhow::{Context, Result};
use svcdir_adapters::ExtractorRegistry;
use svcdir_storage::{RecordStore, StatsStore};

pub mod batch;
pub mod config;
pub mod driver;
pub mod ingest;
pub mod retry;
pub mod runner;
pub mod validator;

pub use batch::{BatchRun, BatchScheduler, SettledJob};
pub use config::{ConfigError, DiscoveryConfig, JobsFile, RegionConfig};
pub use driver::{CycleDriver, DriverError};
pub use ingest::Ingestor;
pub use retry::{RetryError, RetryPolicy, RetrySuccess, RetryWrapper};
pub use runner::{JobExtraction, JobRunner};
pub use validator::{RecordValidator, Rejection};

pub const CRATE_NAME: &str = "svcdir-sync";

/// Wires a driver from configuration, a loaded jobs file and the two stores.
pub fn build_driver(
    config: &DiscoveryConfig,
    jobs_file: JobsFile,
    registry: ExtractorRegistry,
    store: Arc<dyn RecordStore>,
    stats: Arc<dyn StatsStore>,
) -> CycleDriver {
    let validator = RecordValidator::new(&jobs_file.region.locality_tokens);
    let runner = JobRunner::new(
        Arc::new(registry),
        RetryWrapper::new(config.retry),
        validator,
        config.job_timeout,
    );
    let ingestor = Ingestor::new(store, jobs_file.region);
    let scheduler = BatchScheduler::new(config.max_concurrent, config.batch_delay);
    CycleDriver::new(
        jobs_file.jobs,
        runner,
        ingestor,
        scheduler,
        stats,
        config.interval,
    )
}

/// Loads `jobs.yaml` from the workspace and builds the built-in extractor registry.
pub async fn load_jobs_and_registry(
    config: &DiscoveryConfig,
) -> Result<(JobsFile, ExtractorRegistry)> {
    let jobs_file = JobsFile::load(&config.jobs_path()).await?;
    let registry = ExtractorRegistry::with_builtin(
        &config.http_client_config(),
        config.extract_api_config(),
    )
    .context("building extractor registry")?;

    for job in &jobs_file.jobs {
        if registry.get(&job.extractor).is_none() {
            tracing::warn!(
                job = %job.name,
                extractor = %job.extractor,
                "job references an unavailable extractor; it will fail each cycle"
            );
        }
    }
    Ok((jobs_file, registry))
}
