//! Durable record storage and the stats/log store for service discovery.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use svcdir_core::{CanonicalRecord, NaturalKey, NewRecord};
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

mod postgres;
mod stats;

pub use postgres::PgRecordStore;
pub use stats::{overlay_stats, FileStatsStore, MemoryStatsStore, StatsStore, LOG_FILE, STATS_FILE};

pub const CRATE_NAME: &str = "svcdir-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    /// Uniqueness constraint hit; callers treat this as a benign skip.
    #[error("duplicate record: {0}")]
    Duplicate(String),
    #[error("database error: {0}")]
    Database(#[source] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                StoreError::Duplicate(db.message().to_string())
            }
            _ => StoreError::Database(err),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted(Uuid),
    Updated(Uuid),
}

impl UpsertOutcome {
    pub fn id(&self) -> Uuid {
        match self {
            UpsertOutcome::Inserted(id) | UpsertOutcome::Updated(id) => *id,
        }
    }
}

/// Relational store of canonical records, shared by all concurrent jobs.
///
/// `upsert` must be atomic per natural key: a missing key inserts, a present key
/// coalesces non-null incoming fields and keeps the higher confidence score.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn upsert(&self, record: NewRecord) -> Result<UpsertOutcome, StoreError>;

    /// Number of active canonical records.
    async fn count(&self) -> Result<u64, StoreError>;

    async fn find(&self, key: &NaturalKey) -> Result<Option<CanonicalRecord>, StoreError>;
}

#[async_trait]
impl<S: RecordStore + ?Sized> RecordStore for Arc<S> {
    async fn upsert(&self, record: NewRecord) -> Result<UpsertOutcome, StoreError> {
        (**self).upsert(record).await
    }

    async fn count(&self) -> Result<u64, StoreError> {
        (**self).count().await
    }

    async fn find(&self, key: &NaturalKey) -> Result<Option<CanonicalRecord>, StoreError> {
        (**self).find(key).await
    }
}

/// In-process record store with the same merge semantics as [`PgRecordStore`].
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    records: Mutex<HashMap<NaturalKey, CanonicalRecord>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<CanonicalRecord> {
        let map = self.records.lock().await;
        let mut records: Vec<_> = map.values().cloned().collect();
        records.sort_by(|a, b| a.key.cmp(&b.key));
        records
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn upsert(&self, record: NewRecord) -> Result<UpsertOutcome, StoreError> {
        let now = Utc::now();
        let mut map = self.records.lock().await;
        match map.get_mut(&record.key) {
            Some(existing) => {
                existing.merge(record, now);
                Ok(UpsertOutcome::Updated(existing.id))
            }
            None => {
                let canonical = CanonicalRecord::from_new(record, now);
                let id = canonical.id;
                map.insert(canonical.key.clone(), canonical);
                Ok(UpsertOutcome::Inserted(id))
            }
        }
    }

    async fn count(&self) -> Result<u64, StoreError> {
        Ok(self.records.lock().await.len() as u64)
    }

    async fn find(&self, key: &NaturalKey) -> Result<Option<CanonicalRecord>, StoreError> {
        Ok(self.records.lock().await.get(key).cloned())
    }
}
