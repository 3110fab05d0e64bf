//! In-memory timetable snapshot with indexed lookups.
//!
//! `ScheduleIndex` is built once per schedule refresh and held
//! read-only for the lifetime of a run. Construction is a pure
//! function of the loaded tables; all per-observation queries are
//! direct map lookups or a bounded grid scan.

pub mod grid;
pub mod tables;

use anyhow::{Result, bail};
use std::collections::HashMap;

use crate::schedule::grid::StopGrid;
use crate::schedule::tables::ScheduleTables;

#[derive(Debug, Clone)]
pub struct Stop {
    pub stop_id: String,
    pub stop_name: String,
    pub stop_lat: f64,
    pub stop_lon: f64,
}

/// One scheduled call of a trip at a stop. `arrival_time` keeps the
/// original text form for audit; hours may exceed 24 for trips that
/// continue past midnight.
#[derive(Debug, Clone)]
pub struct StopTime {
    pub stop_id: String,
    pub stop_sequence: u32,
    pub arrival_time: String,
}

/// Trip metadata pre-joined with its route at index construction.
#[derive(Debug, Clone)]
pub struct TripInfo {
    pub route_id: String,
    pub trip_headsign: Option<String>,
    pub route_short_name: Option<String>,
    pub route_long_name: Option<String>,
}

pub struct ScheduleIndex {
    stops: HashMap<String, Stop>,
    trips: HashMap<String, TripInfo>,
    stop_times: HashMap<String, Vec<StopTime>>,
    grid: StopGrid,
    grid_stop_ids: Vec<String>,
}

impl ScheduleIndex {
    /// Builds the index from loaded tables. Fails without partial
    /// state if a required table is empty.
    pub fn from_tables(tables: ScheduleTables) -> Result<Self> {
        if tables.stops.is_empty() {
            bail!("stops table is empty");
        }
        if tables.stop_times.is_empty() {
            bail!("stop_times table is empty");
        }

        let routes: HashMap<String, (String, Option<String>)> = tables
            .routes
            .into_iter()
            .map(|r| (r.route_id, (r.route_short_name, r.route_long_name)))
            .collect();

        let trips: HashMap<String, TripInfo> = tables
            .trips
            .into_iter()
            .map(|t| {
                let route = routes.get(&t.route_id);
                let info = TripInfo {
                    route_id: t.route_id,
                    trip_headsign: t.trip_headsign,
                    route_short_name: route.map(|(short, _)| short.clone()),
                    route_long_name: route.and_then(|(_, long)| long.clone()),
                };
                (t.trip_id, info)
            })
            .collect();

        let mut stop_times: HashMap<String, Vec<StopTime>> = HashMap::new();
        for row in tables.stop_times {
            stop_times.entry(row.trip_id).or_default().push(StopTime {
                stop_id: row.stop_id,
                stop_sequence: row.stop_sequence,
                arrival_time: row.arrival_time,
            });
        }
        for sequence in stop_times.values_mut() {
            sequence.sort_by_key(|st| st.stop_sequence);
        }

        let mut grid_stop_ids = Vec::with_capacity(tables.stops.len());
        let mut points = Vec::with_capacity(tables.stops.len());
        let mut stops = HashMap::with_capacity(tables.stops.len());
        for row in tables.stops {
            grid_stop_ids.push(row.stop_id.clone());
            points.push((row.stop_lat, row.stop_lon));
            stops.insert(
                row.stop_id.clone(),
                Stop {
                    stop_id: row.stop_id,
                    stop_name: row.stop_name,
                    stop_lat: row.stop_lat,
                    stop_lon: row.stop_lon,
                },
            );
        }

        Ok(Self {
            stops,
            trips,
            stop_times,
            grid: StopGrid::build(points),
            grid_stop_ids,
        })
    }

    /// The single closest stop within `max_distance_meters` of the
    /// coordinate, with its distance in meters.
    pub fn nearest_stop(
        &self,
        lat: f64,
        lon: f64,
        max_distance_meters: f64,
    ) -> Option<(&str, f64)> {
        self.grid
            .nearest(lat, lon, max_distance_meters)
            .map(|(i, d)| (self.grid_stop_ids[i].as_str(), d))
    }

    /// The trip's calls in ascending stop-sequence order; empty for an
    /// unknown trip.
    pub fn stops_for_trip(&self, trip_id: &str) -> &[StopTime] {
        self.stop_times
            .get(trip_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn trip_info(&self, trip_id: &str) -> Option<&TripInfo> {
        self.trips.get(trip_id)
    }

    pub fn stop_info(&self, stop_id: &str) -> Option<&Stop> {
        self.stops.get(stop_id)
    }

    pub fn stop_count(&self) -> usize {
        self.stops.len()
    }

    pub fn trip_count(&self) -> usize {
        self.stop_times.len()
    }
}

/// Parses a GTFS `HH:MM:SS` schedule time into seconds since local
/// midnight. Hours may be 24 or more for post-midnight trips. Returns
/// `None` on malformed input.
pub fn time_of_day_seconds(text: &str) -> Option<u32> {
    let mut parts = text.split(':');
    let hours: u32 = parts.next()?.trim().parse().ok()?;
    let minutes: u32 = parts.next()?.parse().ok()?;
    let seconds: u32 = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    hours
        .checked_mul(3600)?
        .checked_add(minutes.checked_mul(60)?)?
        .checked_add(seconds)
}
