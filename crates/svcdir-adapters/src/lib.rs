//! Extractor contracts + built-in extractor implementations.
//!
//! An extractor turns one [`Job`] into zero or more raw [`CandidateRecord`]s. The
//! orchestrator never looks inside: site-specific parsing lives behind the single
//! [`Extractor`] trait and is selected per job through the [`ExtractorRegistry`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use svcdir_core::{CandidateRecord, Job};
use thiserror::Error;

pub mod contact;
mod command;
mod extract_api;
mod page;

pub use command::CommandExtractor;
pub use extract_api::{candidates_from_json, ExtractApiConfig, ExtractApiExtractor};
pub use page::{parse_page, PageExtractor};

pub const CRATE_NAME: &str = "svcdir-adapters";

/// What an extractor returned for one invocation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extraction {
    pub candidates: Vec<CandidateRecord>,
    /// The upstream reported a rate limit even though the call completed.
    pub rate_limited: bool,
}

impl Extraction {
    pub fn of(candidates: Vec<CandidateRecord>) -> Self {
        Self {
            candidates,
            rate_limited: false,
        }
    }

    pub fn rate_limited() -> Self {
        Self {
            candidates: Vec::new(),
            rate_limited: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    RateLimited,
    Transient,
    Permanent,
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("unparseable response: {0}")]
    Parse(String),
    #[error("command failed: {0}")]
    Command(String),
    #[error("job misconfigured: {0}")]
    Config(String),
}

impl ExtractError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            ExtractError::RateLimited(_) => RetryDisposition::RateLimited,
            ExtractError::HttpStatus { status, .. } => {
                classify_status(StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY))
            }
            ExtractError::Request(_) | ExtractError::Parse(_) | ExtractError::Command(_) => {
                RetryDisposition::Transient
            }
            ExtractError::Config(_) => RetryDisposition::Permanent,
        }
    }
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::RateLimited
    } else if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        RetryDisposition::Transient
    } else {
        RetryDisposition::Permanent
    }
}

/// Message heuristics for upstreams that report throttling in an error body.
pub fn mentions_rate_limit(text: &str) -> bool {
    let lower = text.to_ascii_lowercase();
    lower.contains("429") || lower.contains("rate limit") || lower.contains("too many requests")
}

/// Error for a non-success HTTP status, promoting 429 to [`ExtractError::RateLimited`].
pub fn status_error(status: StatusCode, url: &str) -> ExtractError {
    if classify_status(status) == RetryDisposition::RateLimited {
        ExtractError::RateLimited(format!("http {} from {url}", status.as_u16()))
    } else {
        ExtractError::HttpStatus {
            status: status.as_u16(),
            url: url.to_string(),
        }
    }
}

#[async_trait]
pub trait Extractor: Send + Sync {
    fn kind(&self) -> &'static str;

    /// Confidence applied to candidates that do not carry their own.
    fn default_confidence(&self) -> Option<f64> {
        None
    }

    async fn extract(&self, job: &Job) -> Result<Extraction, ExtractError>;
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
        }
    }
}

pub fn build_http_client(config: &HttpClientConfig) -> anyhow::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .gzip(true)
        .brotli(true)
        .timeout(config.timeout);

    if let Some(user_agent) = &config.user_agent {
        builder = builder.user_agent(user_agent.clone());
    }

    builder.build().context("building reqwest client")
}

pub const PAGE_EXTRACTOR: &str = "page";
pub const EXTRACT_API_EXTRACTOR: &str = "extract_api";
pub const COMMAND_EXTRACTOR: &str = "command";

/// Named extractors available to jobs.
#[derive(Clone, Default)]
pub struct ExtractorRegistry {
    extractors: BTreeMap<String, Arc<dyn Extractor>>,
}

impl ExtractorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `page` and `command`, plus `extract_api` when an API config is given.
    pub fn with_builtin(
        http: &HttpClientConfig,
        extract_api: Option<ExtractApiConfig>,
    ) -> anyhow::Result<Self> {
        let client = build_http_client(http)?;
        let mut registry = Self::new();
        registry.register(PAGE_EXTRACTOR, Arc::new(PageExtractor::new(client.clone())));
        registry.register(COMMAND_EXTRACTOR, Arc::new(CommandExtractor::new()));
        if let Some(api) = extract_api {
            registry.register(
                EXTRACT_API_EXTRACTOR,
                Arc::new(ExtractApiExtractor::new(client, api)),
            );
        }
        Ok(registry)
    }

    pub fn register(&mut self, name: impl Into<String>, extractor: Arc<dyn Extractor>) {
        self.extractors.insert(name.into(), extractor);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Extractor>> {
        self.extractors.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        self.extractors.keys().map(String::as_str).collect()
    }
}

impl std::fmt::Debug for ExtractorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtractorRegistry")
            .field("extractors", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed;

    #[async_trait]
    impl Extractor for Fixed {
        fn kind(&self) -> &'static str {
            "fixed"
        }

        async fn extract(&self, _job: &Job) -> Result<Extraction, ExtractError> {
            Ok(Extraction::of(vec![CandidateRecord::named("Fixed Service")]))
        }
    }

    #[test]
    fn status_classification() {
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::RateLimited
        );
        assert_eq!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE),
            RetryDisposition::Transient
        );
        assert_eq!(classify_status(StatusCode::NOT_FOUND), RetryDisposition::Permanent);
        assert!(matches!(
            status_error(StatusCode::TOO_MANY_REQUESTS, "https://x.test"),
            ExtractError::RateLimited(_)
        ));
        assert_eq!(
            ExtractError::Config("missing target".into()).disposition(),
            RetryDisposition::Permanent
        );
    }

    #[test]
    fn rate_limit_messages_are_detected() {
        assert!(mentions_rate_limit("Rate limit exceeded, retry later"));
        assert!(mentions_rate_limit("HTTP 429"));
        assert!(!mentions_rate_limit("internal server error"));
    }

    #[tokio::test]
    async fn registry_resolves_registered_extractors() {
        let mut registry = ExtractorRegistry::new();
        registry.register("fixed", Arc::new(Fixed));

        let extractor = registry.get("fixed").expect("registered");
        let out = extractor
            .extract(&Job::new("j", "fixed", "n/a"))
            .await
            .expect("extract");
        assert_eq!(out.candidates.len(), 1);
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn builtin_registry_without_api_key_skips_extract_api() {
        let registry =
            ExtractorRegistry::with_builtin(&HttpClientConfig::default(), None).expect("registry");
        assert_eq!(registry.names(), vec![COMMAND_EXTRACTOR, PAGE_EXTRACTOR]);
    }
}
