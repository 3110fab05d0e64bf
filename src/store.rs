//! Durable, idempotent persistence of delay records.
//!
//! Records are appended to a CSV file (header written once) and the
//! (trip_id, stop_id, timestamp) keys are mirrored in an in-memory set
//! that acts as the unique index. The set is seeded from the file at
//! open, so idempotence survives restart.

use anyhow::Result;
use chrono::NaiveDateTime;
use csv::WriterBuilder;
use std::collections::HashSet;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

use crate::record::DelayRecord;

pub type DelayKey = (String, String, NaiveDateTime);

/// Result of an insert attempt. A duplicate key is a normal outcome,
/// never an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    AlreadyPresent,
}

pub struct DelayStore {
    path: PathBuf,
    keys: Mutex<HashSet<DelayKey>>,
    // Serializes appends: the header-or-not check and the write must
    // be atomic when matchers run in parallel.
    file_lock: Mutex<()>,
}

impl DelayStore {
    /// Opens the store at `path`, seeding the key set from any existing
    /// file. An unreadable existing file is a fatal error.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut keys = HashSet::new();

        if path.exists() {
            let mut reader = csv::Reader::from_path(&path)?;
            for row in reader.deserialize::<DelayRecord>() {
                keys.insert(row?.key());
            }
        }
        debug!(path = %path.display(), existing = keys.len(), "Delay store opened");

        Ok(Self {
            path,
            keys: Mutex::new(keys),
            file_lock: Mutex::new(()),
        })
    }

    pub fn exists(&self, trip_id: &str, stop_id: &str, timestamp: NaiveDateTime) -> bool {
        let key = (trip_id.to_string(), stop_id.to_string(), timestamp);
        self.keys.lock().unwrap().contains(&key)
    }

    /// Appends `record` unless its key is already present. The key is
    /// reserved under the key lock before the write, so two concurrent
    /// inserts of the same key cannot both reach the file; the key
    /// lock is not held across the write, and a failed write releases
    /// the reservation. Appends themselves are serialized so exactly
    /// one writer creates the file header.
    pub fn insert(&self, record: &DelayRecord) -> Result<InsertOutcome> {
        let key = record.key();
        {
            let mut keys = self.keys.lock().unwrap();
            if !keys.insert(key.clone()) {
                return Ok(InsertOutcome::AlreadyPresent);
            }
        }

        let written = {
            let _guard = self.file_lock.lock().unwrap();
            append_row(&self.path, record)
        };
        if let Err(e) = written {
            self.keys.lock().unwrap().remove(&key);
            return Err(e);
        }
        Ok(InsertOutcome::Inserted)
    }

    /// All records with `timestamp >= cutoff`, read back from the file.
    pub fn load_since(&self, cutoff: NaiveDateTime) -> Result<Vec<DelayRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let mut reader = csv::Reader::from_path(&self.path)?;
        let mut records = Vec::new();
        for row in reader.deserialize::<DelayRecord>() {
            let record = row?;
            if record.timestamp >= cutoff {
                records.push(record);
            }
        }
        Ok(records)
    }

    pub fn len(&self) -> usize {
        self.keys.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn append_row(path: &Path, record: &DelayRecord) -> Result<()> {
    let file_exists = path.exists();
    let file = OpenOptions::new().append(true).create(true).open(path)?;

    let mut writer = WriterBuilder::new()
        .has_headers(!file_exists) // IMPORTANT when appending
        .from_writer(file);

    writer.serialize(record)?;
    writer.flush()?;

    Ok(())
}
