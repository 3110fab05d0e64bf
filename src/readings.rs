//! Reading batches produced by the external feed collector.
//!
//! The collector decodes the real-time feed and appends one JSON
//! document per poll into a readings directory. This module only
//! consumes those documents; the trait seam lets tests and alternative
//! backends stand in for the directory.

use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::warn;

/// One decoded vehicle position as the collector writes it. Every
/// field is optional so a defective entry surfaces as a per-observation
/// error instead of poisoning the whole batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VehicleObservation {
    #[serde(default)]
    pub vehicle_id: Option<String>,
    #[serde(default)]
    pub trip_id: Option<String>,
    #[serde(default)]
    pub route_id: Option<String>,
    #[serde(default)]
    pub lat: Option<f64>,
    #[serde(default)]
    pub lon: Option<f64>,
    /// The vehicle's own clock, when the feed carries one.
    #[serde(default)]
    pub timestamp: Option<NaiveDateTime>,
}

/// One collector poll: a timestamped list of raw vehicle entries.
/// Entries stay as raw JSON until the engine deserializes them one by
/// one, so a single malformed entry is countable and skippable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadingBatch {
    pub batch_id: String,
    /// When the collector wrote the batch (local wall clock).
    pub recorded_at: NaiveDateTime,
    /// The upstream feed's own header timestamp, when present.
    #[serde(default)]
    pub feed_timestamp: Option<NaiveDateTime>,
    pub vehicles: Vec<serde_json::Value>,
}

impl ReadingBatch {
    /// The batch-level observation time: the feed's header timestamp
    /// when the collector captured one, else the write time.
    pub fn observed_at(&self) -> NaiveDateTime {
        self.feed_timestamp.unwrap_or(self.recorded_at)
    }
}

/// Where the engine pulls reading batches from.
#[async_trait]
pub trait ReadingsSource: Send + Sync {
    /// The `limit` most recent batches, newest first.
    async fn most_recent(&self, limit: usize) -> Result<Vec<ReadingBatch>>;

    /// The single newest batch, if any exist.
    async fn newest(&self) -> Result<Option<ReadingBatch>>;

    /// A specific batch by its opaque identifier.
    async fn by_id(&self, batch_id: &str) -> Result<Option<ReadingBatch>>;
}

/// Directory of per-batch JSON documents, one file per collector poll.
pub struct FsReadingsSource {
    dir: PathBuf,
}

impl FsReadingsSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Reads every parseable batch in the directory, newest first.
    /// Unreadable or malformed files are logged and skipped; only a
    /// failure to list the directory itself is an error.
    fn load_all(&self) -> Result<Vec<ReadingBatch>> {
        let mut batches = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let content = match std::fs::read_to_string(&path) {
                Ok(c) => c,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Unreadable batch file, skipping");
                    continue;
                }
            };
            match serde_json::from_str::<ReadingBatch>(&content) {
                Ok(batch) => batches.push(batch),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Malformed batch file, skipping");
                }
            }
        }
        batches.sort_by(|a, b| b.recorded_at.cmp(&a.recorded_at));
        Ok(batches)
    }
}

#[async_trait]
impl ReadingsSource for FsReadingsSource {
    async fn most_recent(&self, limit: usize) -> Result<Vec<ReadingBatch>> {
        let mut batches = self.load_all()?;
        batches.truncate(limit);
        Ok(batches)
    }

    async fn newest(&self) -> Result<Option<ReadingBatch>> {
        Ok(self.load_all()?.into_iter().next())
    }

    async fn by_id(&self, batch_id: &str) -> Result<Option<ReadingBatch>> {
        Ok(self
            .load_all()?
            .into_iter()
            .find(|b| b.batch_id == batch_id))
    }
}
