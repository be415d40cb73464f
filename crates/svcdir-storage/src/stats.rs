use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value as JsonValue};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

use crate::StoreError;

pub const STATS_FILE: &str = "scraper-stats.json";
pub const LOG_FILE: &str = "scraper.log";

/// Durable stats blob plus an append-only log, written at cycle boundaries.
#[async_trait]
pub trait StatsStore: Send + Sync {
    async fn append_log(&self, line: &str) -> Result<(), StoreError>;

    async fn read_stats(&self) -> Result<Option<JsonValue>, StoreError>;

    /// Overlays `update` onto the stored blob and returns the merged result.
    async fn write_stats(&self, update: JsonValue) -> Result<JsonValue, StoreError>;
}

/// Top-level object overlay; `lastUpdated` is always refreshed.
pub fn overlay_stats(current: Option<JsonValue>, update: JsonValue, now: DateTime<Utc>) -> JsonValue {
    let mut merged = match current {
        Some(JsonValue::Object(map)) => map,
        _ => Map::new(),
    };
    match update {
        JsonValue::Object(map) => merged.extend(map),
        JsonValue::Null => {}
        other => {
            merged.insert("value".to_string(), other);
        }
    }
    merged.insert(
        "lastUpdated".to_string(),
        JsonValue::String(now.to_rfc3339()),
    );
    JsonValue::Object(merged)
}

/// Stats and log kept as files under a data directory.
#[derive(Debug, Clone)]
pub struct FileStatsStore {
    root: PathBuf,
}

impl FileStatsStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn stats_path(&self) -> PathBuf {
        self.root.join(STATS_FILE)
    }

    pub fn log_path(&self) -> PathBuf {
        self.root.join(LOG_FILE)
    }

    async fn ensure_root(&self) -> Result<(), StoreError> {
        fs::create_dir_all(&self.root)
            .await
            .map_err(|source| io_error(&self.root, source))
    }

    /// Write via temp file + rename so readers never observe a partial blob.
    async fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
        self.ensure_root().await?;
        let temp_path = self.root.join(format!(".{}.stats.tmp", Uuid::new_v4()));

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(|source| io_error(&temp_path, source))?;
        file.write_all(bytes)
            .await
            .map_err(|source| io_error(&temp_path, source))?;
        file.flush()
            .await
            .map_err(|source| io_error(&temp_path, source))?;
        drop(file);

        if let Err(source) = fs::rename(&temp_path, path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(io_error(path, source));
        }
        Ok(())
    }
}

#[async_trait]
impl StatsStore for FileStatsStore {
    async fn append_log(&self, line: &str) -> Result<(), StoreError> {
        self.ensure_root().await?;
        let path = self.log_path();
        let entry = format!("[{}] {}\n", Utc::now().to_rfc3339(), line);
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|source| io_error(&path, source))?;
        file.write_all(entry.as_bytes())
            .await
            .map_err(|source| io_error(&path, source))?;
        Ok(())
    }

    async fn read_stats(&self) -> Result<Option<JsonValue>, StoreError> {
        let path = self.stats_path();
        match fs::read_to_string(&path).await {
            Ok(text) => Ok(Some(serde_json::from_str(&text)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(io_error(&path, source)),
        }
    }

    async fn write_stats(&self, update: JsonValue) -> Result<JsonValue, StoreError> {
        let current = match self.read_stats().await {
            Ok(current) => current,
            Err(err) => {
                warn!(error = %err, "discarding unreadable stats blob");
                None
            }
        };
        let merged = overlay_stats(current, update, Utc::now());
        let bytes = serde_json::to_vec_pretty(&merged)?;
        self.write_atomic(&self.stats_path(), &bytes).await?;
        Ok(merged)
    }
}

/// Process-local stats and log, for dry runs and tests.
#[derive(Debug, Default)]
pub struct MemoryStatsStore {
    stats: Mutex<Option<JsonValue>>,
    log: Mutex<Vec<String>>,
}

impl MemoryStatsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn log_lines(&self) -> Vec<String> {
        self.log.lock().await.clone()
    }
}

#[async_trait]
impl StatsStore for MemoryStatsStore {
    async fn append_log(&self, line: &str) -> Result<(), StoreError> {
        self.log.lock().await.push(line.to_string());
        Ok(())
    }

    async fn read_stats(&self) -> Result<Option<JsonValue>, StoreError> {
        Ok(self.stats.lock().await.clone())
    }

    async fn write_stats(&self, update: JsonValue) -> Result<JsonValue, StoreError> {
        let mut stats = self.stats.lock().await;
        let merged = overlay_stats(stats.take(), update, Utc::now());
        *stats = Some(merged.clone());
        Ok(merged)
    }
}

fn io_error(path: &Path, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.display().to_string(),
        source,
    }
}
