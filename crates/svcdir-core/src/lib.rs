//! Core domain model for local service directory discovery.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

pub const CRATE_NAME: &str = "svcdir-core";

/// Confidence assigned when neither the candidate nor its extractor supplies one.
pub const DEFAULT_CONFIDENCE: f64 = 0.8;

/// Schema-less provenance attached to records by extractors.
pub type Metadata = BTreeMap<String, JsonValue>;

/// Optional CSS selectors used by HTML page extraction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSelectors {
    #[serde(default)]
    pub item: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
}

/// One configured unit of discovery work. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub name: String,
    /// Registry key of the extractor that handles this job.
    pub extractor: String,
    /// URL or executable reference, interpreted by the extractor.
    pub target: String,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub schema: Option<JsonValue>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub data_source: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub selectors: Option<JobSelectors>,
}

fn default_enabled() -> bool {
    true
}

impl Job {
    pub fn new(
        name: impl Into<String>,
        extractor: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            extractor: extractor.into(),
            target: target.into(),
            timeout_secs: None,
            prompt: None,
            schema: None,
            enabled: true,
            data_source: None,
            category: None,
            selectors: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = Some(timeout.as_secs().max(1));
        self
    }

    /// Per-job timeout, falling back to the configured default.
    pub fn timeout(&self, default: Duration) -> Duration {
        self.timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(default)
    }

    /// Provenance label written to `data_source` on persisted records.
    pub fn data_source(&self) -> &str {
        self.data_source.as_deref().unwrap_or(&self.name)
    }
}

/// Unvalidated, unpersisted result from an extractor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CandidateRecord {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub website: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl CandidateRecord {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Default::default()
        }
    }
}

/// Deduplication key: normalized name plus normalized address (empty when absent).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NaturalKey {
    pub name: String,
    pub address: String,
}

impl NaturalKey {
    pub fn new(name: &str, address: Option<&str>) -> Self {
        Self {
            name: normalize_key_fragment(name),
            address: address.map(normalize_key_fragment).unwrap_or_default(),
        }
    }

    /// Stable record identity derived from the key.
    pub fn record_id(&self) -> Uuid {
        let source = format!("{}|{}", self.name, self.address);
        Uuid::new_v5(&Uuid::NAMESPACE_OID, source.as_bytes())
    }
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.address.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{} @ {}", self.name, self.address)
        }
    }
}

/// Lowercases, drops punctuation and collapses whitespace.
pub fn normalize_key_fragment(input: &str) -> String {
    input
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Normalized, ready-to-persist record handed from ingestion to a record store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRecord {
    pub key: NaturalKey,
    pub name: String,
    pub description: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub website: Option<String>,
    pub address: Option<String>,
    pub category: Option<String>,
    pub suburb: Option<String>,
    pub postcode: Option<String>,
    pub state: Option<String>,
    pub data_source: String,
    pub confidence_score: f64,
    pub metadata: Metadata,
}

/// Persisted, deduplicated directory entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub id: Uuid,
    pub key: NaturalKey,
    pub name: String,
    pub description: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub website: Option<String>,
    pub address: Option<String>,
    pub category: Option<String>,
    pub suburb: Option<String>,
    pub postcode: Option<String>,
    pub state: Option<String>,
    pub data_source: String,
    pub confidence_score: f64,
    pub metadata: Metadata,
    pub discovery_date: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl CanonicalRecord {
    pub fn from_new(record: NewRecord, now: DateTime<Utc>) -> Self {
        Self {
            id: record.key.record_id(),
            key: record.key,
            name: record.name,
            description: record.description,
            phone: record.phone,
            email: record.email,
            website: record.website,
            address: record.address,
            category: record.category,
            suburb: record.suburb,
            postcode: record.postcode,
            state: record.state,
            data_source: record.data_source,
            confidence_score: record.confidence_score,
            metadata: record.metadata,
            discovery_date: now,
            last_updated: now,
        }
    }

    /// Coalescing merge: incoming values win only when present, confidence never drops.
    pub fn merge(&mut self, incoming: NewRecord, now: DateTime<Utc>) {
        coalesce(&mut self.description, incoming.description);
        coalesce(&mut self.phone, incoming.phone);
        coalesce(&mut self.email, incoming.email);
        coalesce(&mut self.website, incoming.website);
        coalesce(&mut self.address, incoming.address);
        coalesce(&mut self.category, incoming.category);
        coalesce(&mut self.suburb, incoming.suburb);
        coalesce(&mut self.postcode, incoming.postcode);
        coalesce(&mut self.state, incoming.state);
        self.confidence_score = self.confidence_score.max(incoming.confidence_score);
        self.metadata.extend(incoming.metadata);
        self.last_updated = now;
    }
}

fn coalesce<T>(existing: &mut Option<T>, incoming: Option<T>) {
    if incoming.is_some() {
        *existing = incoming;
    }
}

/// Result of handing one candidate to the ingestion layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum IngestOutcome {
    Inserted(Uuid),
    Updated(Uuid),
    Skipped(String),
}

/// Terminal failure reasons recorded against a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum FailureReason {
    Timeout,
    ExtractionError(String),
    StorageError(String),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Timeout => write!(f, "timeout"),
            FailureReason::ExtractionError(msg) => write!(f, "extraction error: {msg}"),
            FailureReason::StorageError(msg) => write!(f, "storage error: {msg}"),
        }
    }
}

/// Tagged per-job outcome returned by the batch scheduler.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome<T> {
    Success(T),
    Failure(FailureReason),
}

impl<T> JobOutcome<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, JobOutcome::Success(_))
    }

    pub fn failure(&self) -> Option<&FailureReason> {
        match self {
            JobOutcome::Success(_) => None,
            JobOutcome::Failure(reason) => Some(reason),
        }
    }
}

/// Ingestion counts for a single job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestTally {
    pub inserted: usize,
    pub updated: usize,
    pub skipped: usize,
}

impl IngestTally {
    pub fn record(&mut self, outcome: &IngestOutcome) {
        match outcome {
            IngestOutcome::Inserted(_) => self.inserted += 1,
            IngestOutcome::Updated(_) => self.updated += 1,
            IngestOutcome::Skipped(_) => self.skipped += 1,
        }
    }
}

/// Per-job line item of a cycle run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobReport {
    pub job: String,
    pub success: bool,
    #[serde(default)]
    pub reason: Option<FailureReason>,
    pub candidates: usize,
    pub accepted: usize,
    #[serde(flatten)]
    pub tally: IngestTally,
    pub duration_ms: u64,
}

/// Aggregate result of one pass over all configured jobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleRun {
    pub cycle_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_secs: u64,
    pub success: usize,
    pub failed: usize,
    pub new_records: u64,
    pub inserted: usize,
    pub updated: usize,
    pub skipped: usize,
    pub rejected: usize,
    pub total_records: Option<u64>,
    pub batches: Vec<usize>,
    pub errors: Vec<String>,
    pub jobs: Vec<JobReport>,
    pub interrupted: bool,
}

impl CycleRun {
    /// Starts an empty run; totals are filled in by [`CycleRun::push_job`].
    pub fn begin(started_at: DateTime<Utc>) -> Self {
        Self {
            cycle_id: Uuid::new_v4(),
            started_at,
            finished_at: started_at,
            duration_secs: 0,
            success: 0,
            failed: 0,
            new_records: 0,
            inserted: 0,
            updated: 0,
            skipped: 0,
            rejected: 0,
            total_records: None,
            batches: Vec::new(),
            errors: Vec::new(),
            jobs: Vec::new(),
            interrupted: false,
        }
    }

    pub fn push_job(&mut self, report: JobReport) {
        if report.success {
            self.success += 1;
        } else {
            self.failed += 1;
            if let Some(reason) = &report.reason {
                self.errors.push(format!("{}: {}", report.job, reason));
            }
        }
        self.inserted += report.tally.inserted;
        self.updated += report.tally.updated;
        self.skipped += report.tally.skipped;
        self.rejected += report.candidates.saturating_sub(report.accepted);
        self.jobs.push(report);
    }

    pub fn finish(&mut self, finished_at: DateTime<Utc>) {
        self.finished_at = finished_at;
        self.duration_secs = (finished_at - self.started_at).num_seconds().max(0) as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn new_record(name: &str, address: Option<&str>) -> NewRecord {
        NewRecord {
            key: NaturalKey::new(name, address),
            name: name.to_string(),
            description: None,
            phone: None,
            email: None,
            website: None,
            address: address.map(str::to_string),
            category: None,
            suburb: None,
            postcode: None,
            state: None,
            data_source: "test".into(),
            confidence_score: 0.8,
            metadata: Metadata::new(),
        }
    }

    #[test]
    fn natural_key_ignores_case_punctuation_and_spacing() {
        let a = NaturalKey::new("  Health Clinic ", Some("1 Main St."));
        let b = NaturalKey::new("health   CLINIC", Some("1 main st"));
        assert_eq!(a, b);
        assert_eq!(a.record_id(), b.record_id());
        assert_eq!(NaturalKey::new("Clinic", None).address, "");
    }

    #[test]
    fn merge_keeps_present_fields_and_max_confidence() {
        let t0 = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).single().unwrap();
        let t1 = Utc.with_ymd_and_hms(2026, 1, 2, 0, 0, 0).single().unwrap();

        let mut first = new_record("Clinic", Some("1 Main St"));
        first.email = Some("info@clinic.example".into());
        first.confidence_score = 0.9;
        let mut record = CanonicalRecord::from_new(first, t0);

        let mut second = new_record("Clinic", Some("1 Main St"));
        second.phone = Some("(07) 4747 1234".into());
        second.confidence_score = 0.6;
        record.merge(second, t1);

        assert_eq!(record.email.as_deref(), Some("info@clinic.example"));
        assert_eq!(record.phone.as_deref(), Some("(07) 4747 1234"));
        assert_eq!(record.confidence_score, 0.9);
        assert_eq!(record.discovery_date, t0);
        assert_eq!(record.last_updated, t1);
    }

    #[test]
    fn cycle_run_tallies_job_reports() {
        let t0 = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).single().unwrap();
        let mut run = CycleRun::begin(t0);
        run.push_job(JobReport {
            job: "a".into(),
            success: true,
            reason: None,
            candidates: 4,
            accepted: 3,
            tally: IngestTally {
                inserted: 2,
                updated: 1,
                skipped: 0,
            },
            duration_ms: 10,
        });
        run.push_job(JobReport {
            job: "b".into(),
            success: false,
            reason: Some(FailureReason::Timeout),
            candidates: 0,
            accepted: 0,
            tally: IngestTally::default(),
            duration_ms: 10,
        });
        run.finish(t0 + chrono::Duration::seconds(42));

        assert_eq!(run.success, 1);
        assert_eq!(run.failed, 1);
        assert_eq!(run.inserted, 2);
        assert_eq!(run.rejected, 1);
        assert_eq!(run.errors, vec!["b: timeout".to_string()]);
        assert_eq!(run.duration_secs, 42);
    }

    #[test]
    fn jobs_deserialize_with_defaults() {
        let yaml = "name: council\nextractor: page\ntarget: https://example.org/services\n";
        let job: Job = serde_yaml::from_str(yaml).expect("job yaml");
        assert!(job.enabled);
        assert_eq!(job.timeout(Duration::from_secs(600)), Duration::from_secs(600));
        assert_eq!(job.data_source(), "council");
    }
}
