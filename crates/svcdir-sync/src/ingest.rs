//! Normalization and idempotent upsert of validated candidates.

use std::sync::Arc;

use serde_json::json;
use svcdir_adapters::contact::{canonical_phone, find_email, find_phone, find_postcode};
use svcdir_core::{
    CandidateRecord, IngestOutcome, IngestTally, Job, NaturalKey, NewRecord, DEFAULT_CONFIDENCE,
};
use svcdir_storage::{RecordStore, StoreError, UpsertOutcome};
use tracing::{debug, warn};

use crate::config::RegionConfig;

#[derive(Clone)]
pub struct Ingestor {
    store: Arc<dyn RecordStore>,
    region: RegionConfig,
}

impl std::fmt::Debug for Ingestor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ingestor")
            .field("region", &self.region.name)
            .finish_non_exhaustive()
    }
}

impl Ingestor {
    pub fn new(store: Arc<dyn RecordStore>, region: RegionConfig) -> Self {
        Self { store, region }
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    /// Normalizes a candidate into a persistable record; `None` when it has no name.
    pub fn prepare(
        &self,
        job: &Job,
        candidate: CandidateRecord,
        default_confidence: Option<f64>,
    ) -> Option<NewRecord> {
        let name = clean_text(candidate.name.as_deref())?;
        let address = clean_text(candidate.address.as_deref());
        let key = NaturalKey::new(&name, address.as_deref());

        let phone = candidate
            .phone
            .as_deref()
            .and_then(|raw| canonical_phone(raw).or_else(|| find_phone(raw)));
        let email = candidate
            .email
            .as_deref()
            .and_then(find_email)
            .map(|email| email.to_lowercase());
        let website = clean_text(candidate.website.as_deref()).map(|url| {
            if url.starts_with("http://") || url.starts_with("https://") {
                url
            } else {
                format!("https://{url}")
            }
        });
        let postcode = address
            .as_deref()
            .and_then(find_postcode)
            .or_else(|| self.region.postcode.clone());

        let confidence_score = candidate
            .confidence
            .filter(|c| c.is_finite())
            .or(default_confidence)
            .unwrap_or(DEFAULT_CONFIDENCE)
            .clamp(0.0, 1.0);

        let mut metadata = candidate.metadata;
        metadata.insert("job".into(), json!(job.name));
        if !candidate.source.is_empty() {
            metadata
                .entry("source_url".into())
                .or_insert_with(|| json!(candidate.source));
        }

        Some(NewRecord {
            key,
            name,
            description: clean_text(candidate.description.as_deref()),
            phone,
            email,
            website,
            address,
            category: clean_text(candidate.category.as_deref()),
            suburb: self.region.suburb.clone(),
            postcode,
            state: self.region.state.clone(),
            data_source: job.data_source().to_string(),
            confidence_score,
            metadata,
        })
    }

    /// Upserts one candidate. A uniqueness violation is a benign skip; any other
    /// storage error is returned to the caller.
    pub async fn ingest(
        &self,
        job: &Job,
        candidate: CandidateRecord,
        default_confidence: Option<f64>,
    ) -> Result<IngestOutcome, StoreError> {
        let Some(record) = self.prepare(job, candidate, default_confidence) else {
            return Ok(IngestOutcome::Skipped("missing name".into()));
        };
        let key = record.key.clone();

        match self.store.upsert(record).await {
            Ok(UpsertOutcome::Inserted(id)) => {
                debug!(job = %job.name, %key, "record inserted");
                Ok(IngestOutcome::Inserted(id))
            }
            Ok(UpsertOutcome::Updated(id)) => {
                debug!(job = %job.name, %key, "record updated");
                Ok(IngestOutcome::Updated(id))
            }
            Err(StoreError::Duplicate(detail)) => {
                debug!(job = %job.name, %key, %detail, "duplicate record skipped");
                Ok(IngestOutcome::Skipped("duplicate".into()))
            }
            Err(err) => Err(err),
        }
    }

    /// Ingests a job's accepted candidates in order. Each upsert stands alone, so
    /// a storage error does not stop the rest; the first one is returned at the end.
    pub async fn ingest_all(
        &self,
        job: &Job,
        candidates: Vec<CandidateRecord>,
        default_confidence: Option<f64>,
    ) -> Result<IngestTally, StoreError> {
        let mut tally = IngestTally::default();
        let mut first_error = None;
        for candidate in candidates {
            match self.ingest(job, candidate, default_confidence).await {
                Ok(outcome) => tally.record(&outcome),
                Err(err) => {
                    warn!(job = %job.name, error = %err, "storage error during ingestion");
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(tally),
        }
    }
}

/// Trims and collapses internal whitespace; empty strings become `None`.
fn clean_text(raw: Option<&str>) -> Option<String> {
    let joined = raw?.split_whitespace().collect::<Vec<_>>().join(" ");
    (!joined.is_empty()).then_some(joined)
}
