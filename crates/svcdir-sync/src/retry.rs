//! Rate-limit aware retry around a single extractor call.
//!
//! This is the only place retry policy lives. Rate-limit signals back off linearly
//! (`base * attempt`, capped); every other retryable error waits a fixed delay.
//! Permanent errors fail on the spot without consuming attempts.

use std::time::Duration;

use svcdir_adapters::{Extraction, Extractor, RetryDisposition};
use svcdir_core::{CandidateRecord, Job};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub rate_limit_base: Duration,
    pub rate_limit_cap: Duration,
    pub retry_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            rate_limit_base: Duration::from_secs(60),
            rate_limit_cap: Duration::from_secs(300),
            retry_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Linear-with-cap delay after a rate-limited attempt (1-based).
    pub fn rate_limit_delay(&self, attempt: u32) -> Duration {
        self.rate_limit_base
            .saturating_mul(attempt.max(1))
            .min(self.rate_limit_cap)
    }
}

#[derive(Debug, Error)]
pub enum RetryError {
    #[error("still rate limited after {attempts} attempts")]
    RateLimitExhausted { attempts: u32 },
    #[error("failed after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },
    #[error("permanent failure: {0}")]
    Permanent(String),
    /// The next backoff would overrun the job's deadline.
    #[error("backoff of {delay:?} exceeds remaining job budget")]
    BudgetExceeded { delay: Duration },
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetrySuccess {
    pub candidates: Vec<CandidateRecord>,
    pub attempts: u32,
}

enum AttemptFailure {
    RateLimited(String),
    Transient(String),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RetryWrapper {
    policy: RetryPolicy,
}

impl RetryWrapper {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Invokes `extractor` up to `max_attempts` times.
    ///
    /// With a `deadline`, a backoff that would end past it fails with
    /// [`RetryError::BudgetExceeded`] instead of sleeping.
    pub async fn call(
        &self,
        extractor: &dyn Extractor,
        job: &Job,
        deadline: Option<Instant>,
    ) -> Result<RetrySuccess, RetryError> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let failure = match extractor.extract(job).await {
                Ok(Extraction {
                    rate_limited: false,
                    candidates,
                }) => {
                    return Ok(RetrySuccess {
                        candidates,
                        attempts: attempt,
                    })
                }
                Ok(Extraction {
                    rate_limited: true,
                    ..
                }) => AttemptFailure::RateLimited("extractor reported rate limit".to_string()),
                Err(err) => match err.disposition() {
                    RetryDisposition::RateLimited => AttemptFailure::RateLimited(err.to_string()),
                    RetryDisposition::Transient => AttemptFailure::Transient(err.to_string()),
                    RetryDisposition::Permanent => {
                        return Err(RetryError::Permanent(err.to_string()))
                    }
                },
            };

            if attempt >= max_attempts {
                return Err(match failure {
                    AttemptFailure::RateLimited(_) => RetryError::RateLimitExhausted { attempts: attempt },
                    AttemptFailure::Transient(last) => RetryError::Exhausted {
                        attempts: attempt,
                        last,
                    },
                });
            }

            let delay = match &failure {
                AttemptFailure::RateLimited(reason) => {
                    let delay = self.policy.rate_limit_delay(attempt);
                    info!(job = %job.name, attempt, ?delay, %reason, "rate limited; backing off");
                    delay
                }
                AttemptFailure::Transient(reason) => {
                    warn!(job = %job.name, attempt, %reason, "extraction attempt failed; retrying");
                    self.policy.retry_delay
                }
            };

            if let Some(deadline) = deadline {
                if Instant::now() + delay > deadline {
                    return Err(RetryError::BudgetExceeded { delay });
                }
            }
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use svcdir_adapters::ExtractError;

    use super::*;

    #[derive(Clone, Copy)]
    enum Step {
        Found(usize),
        RateLimitFlag,
        Http429,
        Transient,
        Permanent,
    }

    /// Replays one scripted step per attempt, repeating the last one.
    struct Scripted {
        steps: Mutex<VecDeque<Step>>,
        calls: AtomicU32,
    }

    impl Scripted {
        fn new(steps: Vec<Step>) -> Self {
            Self {
                steps: Mutex::new(steps.into()),
                calls: AtomicU32::new(0),
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Extractor for Scripted {
        fn kind(&self) -> &'static str {
            "scripted"
        }

        async fn extract(&self, _job: &Job) -> Result<Extraction, ExtractError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let step = {
                let mut steps = self.steps.lock().unwrap();
                if steps.len() > 1 {
                    steps.pop_front().unwrap()
                } else {
                    *steps.front().unwrap()
                }
            };
            match step {
                Step::Found(n) => Ok(Extraction::of(
                    (0..n).map(|i| CandidateRecord::named(format!("Service {i}"))).collect(),
                )),
                Step::RateLimitFlag => Ok(Extraction::rate_limited()),
                Step::Http429 => Err(ExtractError::RateLimited("http 429".into())),
                Step::Transient => Err(ExtractError::Command("boom".into())),
                Step::Permanent => Err(ExtractError::Config("no url".into())),
            }
        }
    }

    fn job() -> Job {
        Job::new("scripted", "scripted", "https://example.test")
    }

    #[test]
    fn rate_limit_delay_is_linear_and_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.rate_limit_delay(1), Duration::from_secs(60));
        assert_eq!(policy.rate_limit_delay(2), Duration::from_secs(120));
        assert_eq!(policy.rate_limit_delay(5), Duration::from_secs(300));
        assert_eq!(policy.rate_limit_delay(9), Duration::from_secs(300));
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_after_two_rate_limits_with_linear_backoff() {
        let extractor = Scripted::new(vec![Step::Http429, Step::RateLimitFlag, Step::Found(1)]);
        let wrapper = RetryWrapper::new(RetryPolicy::default());

        let started = Instant::now();
        let out = wrapper.call(&extractor, &job(), None).await.expect("success");

        assert_eq!(out.attempts, 3);
        assert_eq!(out.candidates.len(), 1);
        assert_eq!(extractor.calls(), 3);
        assert_eq!(started.elapsed(), Duration::from_secs(60 + 120));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_exactly_max_attempts() {
        let extractor = Scripted::new(vec![Step::Http429]);
        let wrapper = RetryWrapper::new(RetryPolicy::default());

        let started = Instant::now();
        let err = wrapper.call(&extractor, &job(), None).await.unwrap_err();

        assert!(matches!(err, RetryError::RateLimitExhausted { attempts: 3 }));
        assert_eq!(extractor.calls(), 3);
        // no sleep after the final attempt
        assert_eq!(started.elapsed(), Duration::from_secs(60 + 120));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_use_fixed_delay() {
        let extractor = Scripted::new(vec![Step::Transient, Step::Found(0)]);
        let wrapper = RetryWrapper::new(RetryPolicy::default());

        let started = Instant::now();
        let out = wrapper.call(&extractor, &job(), None).await.expect("success");
        assert_eq!(out.attempts, 2);
        assert!(out.candidates.is_empty());
        assert_eq!(started.elapsed(), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_errors_do_not_retry() {
        let extractor = Scripted::new(vec![Step::Permanent]);
        let wrapper = RetryWrapper::new(RetryPolicy::default());

        let err = wrapper.call(&extractor, &job(), None).await.unwrap_err();
        assert!(matches!(err, RetryError::Permanent(_)));
        assert_eq!(extractor.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_past_deadline_fails_fast() {
        let extractor = Scripted::new(vec![Step::Http429]);
        let wrapper = RetryWrapper::new(RetryPolicy::default());

        let deadline = Instant::now() + Duration::from_secs(30);
        let err = wrapper
            .call(&extractor, &job(), Some(deadline))
            .await
            .unwrap_err();
        assert!(matches!(err, RetryError::BudgetExceeded { .. }));
        assert_eq!(extractor.calls(), 1);
    }
}
