//! Correlation of a single vehicle observation against the schedule.
//!
//! Pure computation: the only lookups are against the read-only
//! [`ScheduleIndex`]. Every rejection is an expected outcome with a
//! structured reason, not an error.

use chrono::{NaiveDateTime, Timelike};

use crate::readings::VehicleObservation;
use crate::record::DelayRecord;
use crate::schedule::{ScheduleIndex, time_of_day_seconds};

/// A vehicle must be inside this radius of a stop to count as at it.
pub const STOP_RADIUS_METERS: f64 = 50.0;

/// Delays beyond this magnitude are matching artifacts (wrong day,
/// clock skew, stale trip id), not true half-hour delays.
pub const MAX_DELAY_SECONDS: i64 = 1800;

pub const SECONDS_PER_DAY: u32 = 86_400;

/// Why an observation produced no delay measurement. Most observations
/// in a real feed are legitimately skipped (idle vehicles carry no
/// trip; the nearest stop often serves a different route).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SkipReason {
    /// Observation carries no trip identifier (vehicle off duty).
    NoTrip,
    /// Observation carries no coordinates.
    NoPosition,
    /// No stop within [`STOP_RADIUS_METERS`] of the position.
    NoNearbyStop,
    /// The trip id is not in the timetable.
    UnknownTrip,
    /// The nearest stop is not on this trip's path.
    StopNotOnTrip,
    /// The scheduled arrival text failed to parse.
    UnparseableSchedule,
    /// |delay| exceeded [`MAX_DELAY_SECONDS`].
    DelayOutOfRange,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::NoTrip => "no_trip",
            SkipReason::NoPosition => "no_position",
            SkipReason::NoNearbyStop => "no_nearby_stop",
            SkipReason::UnknownTrip => "unknown_trip",
            SkipReason::StopNotOnTrip => "stop_not_on_trip",
            SkipReason::UnparseableSchedule => "unparseable_schedule",
            SkipReason::DelayOutOfRange => "delay_out_of_range",
        }
    }
}

/// Correlates one observation taken at `observed_at` against the
/// schedule, producing a delay record or the reason there is none.
pub fn correlate(
    schedule: &ScheduleIndex,
    observation: &VehicleObservation,
    observed_at: NaiveDateTime,
) -> Result<DelayRecord, SkipReason> {
    let trip_id = match observation.trip_id.as_deref() {
        Some(id) if !id.is_empty() => id,
        _ => return Err(SkipReason::NoTrip),
    };

    let (lat, lon) = match (observation.lat, observation.lon) {
        (Some(lat), Some(lon)) => (lat, lon),
        _ => return Err(SkipReason::NoPosition),
    };

    let (stop_id, distance) = schedule
        .nearest_stop(lat, lon, STOP_RADIUS_METERS)
        .ok_or(SkipReason::NoNearbyStop)?;

    let calls = schedule.stops_for_trip(trip_id);
    if calls.is_empty() {
        return Err(SkipReason::UnknownTrip);
    }

    let call = calls
        .iter()
        .find(|st| st.stop_id == stop_id)
        .ok_or(SkipReason::StopNotOnTrip)?;

    let mut scheduled_seconds =
        time_of_day_seconds(&call.arrival_time).ok_or(SkipReason::UnparseableSchedule)?;

    let actual_seconds =
        observed_at.hour() * 3600 + observed_at.minute() * 60 + observed_at.second();

    // Post-midnight trips encode hours >= 24; fold them back into the
    // [0, 86400) range the actual side lives in.
    if scheduled_seconds >= SECONDS_PER_DAY {
        scheduled_seconds -= SECONDS_PER_DAY;
    }

    let delay_seconds = i64::from(actual_seconds) - i64::from(scheduled_seconds);
    if delay_seconds.abs() > MAX_DELAY_SECONDS {
        return Err(SkipReason::DelayOutOfRange);
    }

    let trip_info = schedule.trip_info(trip_id);
    let stop_info = schedule.stop_info(stop_id);

    Ok(DelayRecord {
        timestamp: observed_at,
        trip_id: trip_id.to_string(),
        route_id: observation.route_id.clone(),
        route_short_name: trip_info.and_then(|t| t.route_short_name.clone()),
        vehicle_id: observation.vehicle_id.clone(),
        stop_id: stop_id.to_string(),
        stop_name: stop_info.map(|s| s.stop_name.clone()),
        stop_sequence: call.stop_sequence,
        scheduled_arrival: call.arrival_time.clone(),
        actual_arrival_seconds: actual_seconds,
        delay_seconds,
        delay_minutes: round1(delay_seconds as f64 / 60.0),
        distance_to_stop_meters: round1(distance),
        trip_headsign: trip_info.and_then(|t| t.trip_headsign.clone()),
        lat,
        lon,
    })
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::ScheduleIndex;
    use crate::schedule::tables::{RouteRow, ScheduleTables, StopRow, StopTimeRow, TripRow};
    use chrono::NaiveDate;

    fn schedule_with(arrival_time: &str) -> ScheduleIndex {
        let tables = ScheduleTables {
            stops: vec![
                StopRow {
                    stop_id: "5".into(),
                    stop_name: "Rynek".into(),
                    stop_lat: 50.0400,
                    stop_lon: 21.9990,
                },
                // A stop physically nearby but served by another trip
                StopRow {
                    stop_id: "77".into(),
                    stop_name: "Rynek Peron 2".into(),
                    stop_lat: 50.0402,
                    stop_lon: 21.9992,
                },
            ],
            trips: vec![TripRow {
                trip_id: "T1".into(),
                route_id: "10".into(),
                trip_headsign: Some("Dworzec".into()),
            }],
            stop_times: vec![StopTimeRow {
                trip_id: "T1".into(),
                stop_id: "5".into(),
                stop_sequence: 3,
                arrival_time: arrival_time.into(),
            }],
            routes: vec![RouteRow {
                route_id: "10".into(),
                route_short_name: "10".into(),
                route_long_name: None,
            }],
        };
        ScheduleIndex::from_tables(tables).unwrap()
    }

    fn observation(trip_id: Option<&str>, lat: Option<f64>, lon: Option<f64>) -> VehicleObservation {
        VehicleObservation {
            vehicle_id: Some("bus42".into()),
            trip_id: trip_id.map(String::from),
            route_id: Some("10".into()),
            lat,
            lon,
            timestamp: None,
        }
    }

    fn at(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 11, 3)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    #[test]
    fn test_match_at_stop_coordinates() {
        let schedule = schedule_with("08:00:00");
        let obs = observation(Some("T1"), Some(50.0400), Some(21.9990));
        let record = correlate(&schedule, &obs, at(8, 3, 10)).unwrap();

        assert_eq!(record.stop_id, "5");
        assert_eq!(record.stop_sequence, 3);
        assert_eq!(record.delay_seconds, 190);
        assert_eq!(record.delay_minutes, 3.2);
        assert_eq!(record.distance_to_stop_meters, 0.0);
        assert_eq!(record.actual_arrival_seconds, 28_990);
        assert_eq!(record.route_short_name.as_deref(), Some("10"));
        assert_eq!(record.trip_headsign.as_deref(), Some("Dworzec"));
        assert_eq!(record.stop_name.as_deref(), Some("Rynek"));
    }

    #[test]
    fn test_no_trip() {
        let schedule = schedule_with("08:00:00");
        for obs in [
            observation(None, Some(50.0400), Some(21.9990)),
            observation(Some(""), Some(50.0400), Some(21.9990)),
        ] {
            assert_eq!(
                correlate(&schedule, &obs, at(8, 0, 0)),
                Err(SkipReason::NoTrip)
            );
        }
    }

    #[test]
    fn test_no_position() {
        let schedule = schedule_with("08:00:00");
        let obs = observation(Some("T1"), Some(50.0400), None);
        assert_eq!(
            correlate(&schedule, &obs, at(8, 0, 0)),
            Err(SkipReason::NoPosition)
        );
    }

    #[test]
    fn test_no_nearby_stop_beyond_radius() {
        let schedule = schedule_with("08:00:00");
        // ~111 m from every stop
        let obs = observation(Some("T1"), Some(50.0390), Some(21.9990));
        assert_eq!(
            correlate(&schedule, &obs, at(8, 0, 0)),
            Err(SkipReason::NoNearbyStop)
        );
    }

    #[test]
    fn test_unknown_trip() {
        let schedule = schedule_with("08:00:00");
        let obs = observation(Some("ghost"), Some(50.0400), Some(21.9990));
        assert_eq!(
            correlate(&schedule, &obs, at(8, 0, 0)),
            Err(SkipReason::UnknownTrip)
        );
    }

    #[test]
    fn test_stop_not_on_trip() {
        let schedule = schedule_with("08:00:00");
        // Right on stop 77, which T1 never calls at
        let obs = observation(Some("T1"), Some(50.0402), Some(21.9992));
        assert_eq!(
            correlate(&schedule, &obs, at(8, 0, 0)),
            Err(SkipReason::StopNotOnTrip)
        );
    }

    #[test]
    fn test_unparseable_schedule() {
        let schedule = schedule_with("soon");
        let obs = observation(Some("T1"), Some(50.0400), Some(21.9990));
        assert_eq!(
            correlate(&schedule, &obs, at(8, 0, 0)),
            Err(SkipReason::UnparseableSchedule)
        );
    }

    #[test]
    fn test_midnight_wraparound() {
        // Scheduled 25:10:00 (90600 s) normalizes to 01:10:00; observed
        // 01:15:00 is five minutes late, not a 25-hour discrepancy.
        let schedule = schedule_with("25:10:00");
        let obs = observation(Some("T1"), Some(50.0400), Some(21.9990));
        let record = correlate(&schedule, &obs, at(1, 15, 0)).unwrap();

        assert_eq!(record.delay_seconds, 300);
        assert_eq!(record.delay_minutes, 5.0);
        assert_eq!(record.scheduled_arrival, "25:10:00");
    }

    #[test]
    fn test_delay_bound_inclusive() {
        let schedule = schedule_with("08:00:00");
        let obs = observation(Some("T1"), Some(50.0400), Some(21.9990));

        // Exactly 1800 s late is accepted
        let record = correlate(&schedule, &obs, at(8, 30, 0)).unwrap();
        assert_eq!(record.delay_seconds, 1800);

        // 1801 s is rejected as a matching artifact
        assert_eq!(
            correlate(&schedule, &obs, at(8, 30, 1)),
            Err(SkipReason::DelayOutOfRange)
        );
    }

    #[test]
    fn test_early_vehicle_negative_delay() {
        let schedule = schedule_with("08:00:00");
        let obs = observation(Some("T1"), Some(50.0400), Some(21.9990));
        let record = correlate(&schedule, &obs, at(7, 58, 30)).unwrap();

        assert_eq!(record.delay_seconds, -90);
        assert_eq!(record.delay_minutes, -1.5);
    }
}
