//! One job end to end: extract (with retry) then validate, under a hard timeout.

use std::sync::Arc;
use std::time::Duration;

use svcdir_adapters::ExtractorRegistry;
use svcdir_core::{CandidateRecord, FailureReason, Job, JobOutcome};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::retry::{RetryError, RetryWrapper};
use crate::validator::RecordValidator;

/// Validated output of a single job, ready for ingestion.
#[derive(Debug, Clone, PartialEq)]
pub struct JobExtraction {
    /// Candidates the extractor returned before validation.
    pub candidates: usize,
    pub accepted: Vec<CandidateRecord>,
    pub attempts: u32,
    /// Confidence the extractor assigns when a candidate carries none.
    pub default_confidence: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct JobRunner {
    registry: Arc<ExtractorRegistry>,
    retry: RetryWrapper,
    validator: RecordValidator,
    default_timeout: Duration,
}

impl JobRunner {
    pub fn new(
        registry: Arc<ExtractorRegistry>,
        retry: RetryWrapper,
        validator: RecordValidator,
        default_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            retry,
            validator,
            default_timeout,
        }
    }

    pub fn validator(&self) -> &RecordValidator {
        &self.validator
    }

    /// Never panics or propagates: every failure becomes a [`JobOutcome::Failure`].
    ///
    /// When the timeout fires the extraction future is dropped; whatever the
    /// extractor was doing is abandoned and its partial output discarded.
    pub async fn run(&self, job: &Job) -> JobOutcome<JobExtraction> {
        let Some(extractor) = self.registry.get(&job.extractor) else {
            warn!(job = %job.name, extractor = %job.extractor, "no extractor registered");
            return JobOutcome::Failure(FailureReason::ExtractionError(format!(
                "no extractor registered for '{}'",
                job.extractor
            )));
        };

        let timeout = job.timeout(self.default_timeout);
        let deadline = Instant::now() + timeout;
        let attempt = self.retry.call(extractor.as_ref(), job, Some(deadline));

        let success = match tokio::time::timeout(timeout, attempt).await {
            Err(_elapsed) => {
                warn!(job = %job.name, ?timeout, "job timed out");
                return JobOutcome::Failure(FailureReason::Timeout);
            }
            Ok(Err(RetryError::BudgetExceeded { delay })) => {
                warn!(job = %job.name, ?delay, "retry backoff would exceed job timeout");
                return JobOutcome::Failure(FailureReason::Timeout);
            }
            Ok(Err(err)) => {
                warn!(job = %job.name, error = %err, "extraction failed");
                return JobOutcome::Failure(FailureReason::ExtractionError(err.to_string()));
            }
            Ok(Ok(success)) => success,
        };

        let candidates = success.candidates.len();
        let accepted: Vec<CandidateRecord> = success
            .candidates
            .into_iter()
            .filter(|candidate| self.validator.is_valid(candidate))
            .map(|mut candidate| {
                if candidate.source.trim().is_empty() {
                    candidate.source = job.target.clone();
                }
                candidate
            })
            .collect();

        debug!(
            job = %job.name,
            candidates,
            accepted = accepted.len(),
            attempts = success.attempts,
            "job extracted"
        );
        JobOutcome::Success(JobExtraction {
            candidates,
            accepted,
            attempts: success.attempts,
            default_confidence: extractor.default_confidence(),
        })
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use svcdir_adapters::{ExtractError, Extraction, Extractor};

    use super::*;
    use crate::retry::RetryPolicy;

    struct Fixed(Vec<CandidateRecord>);

    #[async_trait]
    impl Extractor for Fixed {
        fn kind(&self) -> &'static str {
            "fixed"
        }

        fn default_confidence(&self) -> Option<f64> {
            Some(0.85)
        }

        async fn extract(&self, _job: &Job) -> Result<Extraction, ExtractError> {
            Ok(Extraction::of(self.0.clone()))
        }
    }

    struct Stalls;

    #[async_trait]
    impl Extractor for Stalls {
        fn kind(&self) -> &'static str {
            "stalls"
        }

        async fn extract(&self, _job: &Job) -> Result<Extraction, ExtractError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(Extraction::default())
        }
    }

    struct AlwaysRateLimited;

    #[async_trait]
    impl Extractor for AlwaysRateLimited {
        fn kind(&self) -> &'static str {
            "limited"
        }

        async fn extract(&self, _job: &Job) -> Result<Extraction, ExtractError> {
            Err(ExtractError::RateLimited("429".into()))
        }
    }

    fn runner() -> JobRunner {
        let mut local = CandidateRecord::named("Example Town Clinic");
        local.phone = Some("(07) 4747 1234".into());
        let far = CandidateRecord::named("Faraway Clinic");

        let mut registry = ExtractorRegistry::new();
        registry.register("fixed", Arc::new(Fixed(vec![local, far])));
        registry.register("stalls", Arc::new(Stalls));
        registry.register("limited", Arc::new(AlwaysRateLimited));
        JobRunner::new(
            Arc::new(registry),
            RetryWrapper::new(RetryPolicy::default()),
            RecordValidator::new(["example town"]),
            Duration::from_secs(600),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn success_keeps_only_valid_candidates() {
        let job = Job::new("fixed-job", "fixed", "https://fixed.example");
        let JobOutcome::Success(out) = runner().run(&job).await else {
            panic!("expected success");
        };
        assert_eq!(out.candidates, 2);
        assert_eq!(out.accepted.len(), 1);
        assert_eq!(out.accepted[0].source, "https://fixed.example");
        assert_eq!(out.default_confidence, Some(0.85));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_jobs_time_out() {
        let job = Job::new("slow", "stalls", "x").with_timeout(Duration::from_secs(5));
        let started = Instant::now();
        let outcome = runner().run(&job).await;
        assert_eq!(outcome, JobOutcome::Failure(FailureReason::Timeout));
        assert_eq!(started.elapsed(), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_longer_than_timeout_is_a_timeout() {
        let job = Job::new("limited", "limited", "x").with_timeout(Duration::from_secs(90));
        let outcome = runner().run(&job).await;
        assert_eq!(outcome, JobOutcome::Failure(FailureReason::Timeout));
    }

    #[tokio::test]
    async fn unknown_extractor_is_an_extraction_error() {
        let job = Job::new("mystery", "nope", "x");
        let outcome = runner().run(&job).await;
        assert!(matches!(
            outcome,
            JobOutcome::Failure(FailureReason::ExtractionError(_))
        ));
    }
}
