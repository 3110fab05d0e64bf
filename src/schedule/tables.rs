//! Raw GTFS table rows and the CSV loader.
//!
//! The static-timetable provider is responsible for downloading and
//! extracting the zipped bundle; this loader starts from the extracted
//! directory and only reads the four tables the correlation engine
//! needs. Extra columns in the files are ignored.

use anyhow::{Result, bail};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
pub struct StopRow {
    pub stop_id: String,
    pub stop_name: String,
    pub stop_lat: f64,
    pub stop_lon: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TripRow {
    pub trip_id: String,
    pub route_id: String,
    #[serde(default)]
    pub trip_headsign: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StopTimeRow {
    pub trip_id: String,
    pub stop_id: String,
    pub stop_sequence: u32,
    pub arrival_time: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RouteRow {
    pub route_id: String,
    pub route_short_name: String,
    #[serde(default)]
    pub route_long_name: Option<String>,
}

/// The loaded timetable tables, exactly as read from disk.
#[derive(Debug)]
pub struct ScheduleTables {
    pub stops: Vec<StopRow>,
    pub trips: Vec<TripRow>,
    pub stop_times: Vec<StopTimeRow>,
    pub routes: Vec<RouteRow>,
}

/// Reads `stops.txt`, `trips.txt`, `stop_times.txt` and `routes.txt`
/// from `dir`. Any missing table is a fatal error.
pub fn load_tables(dir: &Path) -> Result<ScheduleTables> {
    Ok(ScheduleTables {
        stops: read_table(dir, "stops.txt")?,
        trips: read_table(dir, "trips.txt")?,
        stop_times: read_table(dir, "stop_times.txt")?,
        routes: read_table(dir, "routes.txt")?,
    })
}

fn read_table<T: for<'de> Deserialize<'de>>(dir: &Path, name: &str) -> Result<Vec<T>> {
    let path = dir.join(name);
    if !path.exists() {
        bail!("required GTFS table {} not found in {}", name, dir.display());
    }

    let mut reader = csv::Reader::from_path(&path)?;
    let mut rows = Vec::new();
    for row in reader.deserialize() {
        rows.push(row?);
    }
    Ok(rows)
}
