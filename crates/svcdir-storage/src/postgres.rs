use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::Row;
use svcdir_core::{CanonicalRecord, Metadata, NaturalKey, NewRecord};
use tracing::debug;
use uuid::Uuid;

use crate::{RecordStore, StoreError, UpsertOutcome};

const UPSERT_SQL: &str = r#"
INSERT INTO services (
    id, name, name_key, address_key, description, phone, email, website, address,
    category, suburb, postcode, state, data_source, confidence_score, research_metadata,
    discovery_date, last_updated
) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, NOW(), NOW())
ON CONFLICT (name_key, address_key) DO UPDATE SET
    description = COALESCE(EXCLUDED.description, services.description),
    phone = COALESCE(EXCLUDED.phone, services.phone),
    email = COALESCE(EXCLUDED.email, services.email),
    website = COALESCE(EXCLUDED.website, services.website),
    address = COALESCE(EXCLUDED.address, services.address),
    category = COALESCE(EXCLUDED.category, services.category),
    suburb = COALESCE(EXCLUDED.suburb, services.suburb),
    postcode = COALESCE(EXCLUDED.postcode, services.postcode),
    state = COALESCE(EXCLUDED.state, services.state),
    confidence_score = GREATEST(services.confidence_score, EXCLUDED.confidence_score),
    research_metadata = services.research_metadata || EXCLUDED.research_metadata,
    is_active = TRUE,
    last_updated = NOW()
RETURNING id, (xmax = 0) AS inserted
"#;

const SELECT_COLUMNS: &str = "id, name, name_key, address_key, description, phone, email, \
    website, address, category, suburb, postcode, state, data_source, confidence_score, \
    research_metadata, discovery_date, last_updated";

/// Postgres-backed record store over a shared connection pool.
#[derive(Debug, Clone)]
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(30))
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn upsert(&self, record: NewRecord) -> Result<UpsertOutcome, StoreError> {
        let id = record.key.record_id();
        let row = sqlx::query(UPSERT_SQL)
            .bind(id)
            .bind(&record.name)
            .bind(&record.key.name)
            .bind(&record.key.address)
            .bind(&record.description)
            .bind(&record.phone)
            .bind(&record.email)
            .bind(&record.website)
            .bind(&record.address)
            .bind(&record.category)
            .bind(&record.suburb)
            .bind(&record.postcode)
            .bind(&record.state)
            .bind(&record.data_source)
            .bind(record.confidence_score)
            .bind(Json(&record.metadata))
            .fetch_one(&self.pool)
            .await?;

        let id: Uuid = row.try_get("id")?;
        let inserted: bool = row.try_get("inserted")?;
        debug!(%id, key = %record.key, inserted, "upserted service record");
        Ok(if inserted {
            UpsertOutcome::Inserted(id)
        } else {
            UpsertOutcome::Updated(id)
        })
    }

    async fn count(&self) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM services WHERE is_active = TRUE")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn find(&self, key: &NaturalKey) -> Result<Option<CanonicalRecord>, StoreError> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM services WHERE name_key = $1 AND address_key = $2"
        );
        let row = sqlx::query(&sql)
            .bind(&key.name)
            .bind(&key.address)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| canonical_from_row(&row)).transpose()
    }
}

fn canonical_from_row(row: &PgRow) -> Result<CanonicalRecord, StoreError> {
    let metadata: Json<Metadata> = row.try_get("research_metadata")?;
    let discovery_date: DateTime<Utc> = row.try_get("discovery_date")?;
    let last_updated: DateTime<Utc> = row.try_get("last_updated")?;
    Ok(CanonicalRecord {
        id: row.try_get("id")?,
        key: NaturalKey {
            name: row.try_get("name_key")?,
            address: row.try_get("address_key")?,
        },
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        phone: row.try_get("phone")?,
        email: row.try_get("email")?,
        website: row.try_get("website")?,
        address: row.try_get("address")?,
        category: row.try_get("category")?,
        suburb: row.try_get("suburb")?,
        postcode: row.try_get("postcode")?,
        state: row.try_get("state")?,
        data_source: row.try_get("data_source")?,
        confidence_score: row.try_get("confidence_score")?,
        metadata: metadata.0,
        discovery_date,
        last_updated,
    })
}
