//! The persisted delay measurement schema.
//!
//! This is the contract the presentation layer reads; field names and
//! semantics must not change without a version bump.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// One delay measurement for a vehicle observed near a scheduled stop.
///
/// Identity is the (trip_id, stop_id, timestamp) triple; the store
/// never holds two records sharing it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelayRecord {
    /// Observation wall-clock time, carried from the reading batch.
    pub timestamp: NaiveDateTime,
    pub trip_id: String,
    pub route_id: Option<String>,
    pub route_short_name: Option<String>,
    pub vehicle_id: Option<String>,
    pub stop_id: String,
    pub stop_name: Option<String>,
    pub stop_sequence: u32,
    /// Scheduled arrival in its original `HH:MM:SS` text form.
    pub scheduled_arrival: String,
    /// Observed arrival as seconds since local midnight.
    pub actual_arrival_seconds: u32,
    /// Signed delay; negative means early.
    pub delay_seconds: i64,
    /// Delay rounded to one decimal minute.
    pub delay_minutes: f64,
    /// Matched distance rounded to 0.1 m.
    pub distance_to_stop_meters: f64,
    pub trip_headsign: Option<String>,
    pub lat: f64,
    pub lon: f64,
}

impl DelayRecord {
    /// The natural uniqueness key.
    pub fn key(&self) -> (String, String, NaiveDateTime) {
        (self.trip_id.clone(), self.stop_id.clone(), self.timestamp)
    }
}
