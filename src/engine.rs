//! The control loop driving observations through the matcher and into
//! the store.
//!
//! One logical worker per run. A defective observation never aborts
//! its batch; a failed batch never aborts a continuous run; only
//! configuration-time failures are fatal. The store's idempotent key
//! makes retrying a batch safe.

use anyhow::Result;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::matcher::{SkipReason, correlate};
use crate::readings::{ReadingBatch, ReadingsSource, VehicleObservation};
use crate::schedule::ScheduleIndex;
use crate::store::{DelayStore, InsertOutcome};

/// Counters for one processing run or cycle.
#[derive(Debug, Default, Serialize)]
pub struct RunStats {
    pub batches: usize,
    pub observations: usize,
    /// New delay records written.
    pub matched: usize,
    /// Matches whose key was already stored (overlapping windows).
    pub already_present: usize,
    /// Expected rejections, broken down below.
    pub skipped: usize,
    /// Defective observations (malformed fields).
    pub errored: usize,

    pub no_trip: usize,
    pub no_position: usize,
    pub no_nearby_stop: usize,
    pub unknown_trip: usize,
    pub stop_not_on_trip: usize,
    pub unparseable_schedule: usize,
    pub delay_out_of_range: usize,
}

impl RunStats {
    fn record_skip(&mut self, reason: SkipReason) {
        self.skipped += 1;
        match reason {
            SkipReason::NoTrip => self.no_trip += 1,
            SkipReason::NoPosition => self.no_position += 1,
            SkipReason::NoNearbyStop => self.no_nearby_stop += 1,
            SkipReason::UnknownTrip => self.unknown_trip += 1,
            SkipReason::StopNotOnTrip => self.stop_not_on_trip += 1,
            SkipReason::UnparseableSchedule => self.unparseable_schedule += 1,
            SkipReason::DelayOutOfRange => self.delay_out_of_range += 1,
        }
    }

    pub fn absorb(&mut self, other: RunStats) {
        self.batches += other.batches;
        self.observations += other.observations;
        self.matched += other.matched;
        self.already_present += other.already_present;
        self.skipped += other.skipped;
        self.errored += other.errored;
        self.no_trip += other.no_trip;
        self.no_position += other.no_position;
        self.no_nearby_stop += other.no_nearby_stop;
        self.unknown_trip += other.unknown_trip;
        self.stop_not_on_trip += other.stop_not_on_trip;
        self.unparseable_schedule += other.unparseable_schedule;
        self.delay_out_of_range += other.delay_out_of_range;
    }
}

pub struct CorrelationEngine<S: ReadingsSource> {
    source: S,
    store: DelayStore,
    schedule: Arc<ScheduleIndex>,
}

impl<S: ReadingsSource> CorrelationEngine<S> {
    pub fn new(source: S, store: DelayStore, schedule: Arc<ScheduleIndex>) -> Self {
        Self {
            source,
            store,
            schedule,
        }
    }

    pub fn store(&self) -> &DelayStore {
        &self.store
    }

    /// Runs every observation in `batch` through the matcher and
    /// writes new matches. Defective observations and expected
    /// rejections are counted and skipped; only store I/O failure
    /// aborts the batch.
    pub fn process_batch(&self, batch: &ReadingBatch) -> Result<RunStats> {
        let mut stats = RunStats {
            batches: 1,
            ..Default::default()
        };
        let batch_observed_at = batch.observed_at();

        for raw in &batch.vehicles {
            stats.observations += 1;

            let observation: VehicleObservation = match serde_json::from_value(raw.clone()) {
                Ok(obs) => obs,
                Err(e) => {
                    debug!(batch_id = %batch.batch_id, error = %e, "Defective observation");
                    stats.errored += 1;
                    continue;
                }
            };

            let observed_at = observation.timestamp.unwrap_or(batch_observed_at);

            match correlate(&self.schedule, &observation, observed_at) {
                Ok(record) => match self.store.insert(&record)? {
                    InsertOutcome::Inserted => stats.matched += 1,
                    InsertOutcome::AlreadyPresent => stats.already_present += 1,
                },
                Err(reason) => {
                    debug!(
                        batch_id = %batch.batch_id,
                        reason = reason.as_str(),
                        "Observation skipped"
                    );
                    stats.record_skip(reason);
                }
            }
        }

        Ok(stats)
    }

    /// One-shot backfill over the `limit` most recent batches.
    pub async fn backfill(&self, limit: usize) -> Result<RunStats> {
        let batches = self.source.most_recent(limit).await?;
        info!(batches = batches.len(), "Backfill starting");

        let mut totals = RunStats::default();
        for batch in &batches {
            totals.absorb(self.process_batch(batch)?);
        }

        info!(
            batches = totals.batches,
            observations = totals.observations,
            matched = totals.matched,
            already_present = totals.already_present,
            skipped = totals.skipped,
            errored = totals.errored,
            "Backfill complete"
        );
        Ok(totals)
    }

    /// Polls for the newest unseen batch until `shutdown` turns true.
    /// Fetch and processing failures are logged and retried next
    /// cycle; cancellation is observed within one sleep tick and never
    /// lands mid-batch.
    pub async fn run_continuous(
        &self,
        poll_interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        info!(
            poll_interval_secs = poll_interval.as_secs(),
            "Continuous correlation starting"
        );

        // Deliberately loop-local so a restart begins fresh.
        let mut last_batch_id: Option<String> = None;

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.source.newest().await {
                Ok(Some(batch)) if last_batch_id.as_deref() != Some(batch.batch_id.as_str()) => {
                    match self.process_batch(&batch) {
                        Ok(stats) => {
                            info!(
                                batch_id = %batch.batch_id,
                                observations = stats.observations,
                                matched = stats.matched,
                                already_present = stats.already_present,
                                skipped = stats.skipped,
                                errored = stats.errored,
                                "Cycle complete"
                            );
                            last_batch_id = Some(batch.batch_id);
                        }
                        // Retry the same batch next cycle; the
                        // idempotent key makes the rerun harmless.
                        Err(e) => error!(batch_id = %batch.batch_id, error = %e, "Batch failed, retrying next cycle"),
                    }
                }
                Ok(_) => debug!("No new batch"),
                Err(e) => error!(error = %e, "Batch fetch failed, retrying next cycle"),
            }

            tokio::select! {
                _ = tokio::time::sleep(poll_interval) => {}
                _ = shutdown.changed() => {}
            }
        }

        info!("Continuous correlation stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::tables::{RouteRow, ScheduleTables, StopRow, StopTimeRow, TripRow};
    use async_trait::async_trait;
    use chrono::{NaiveDate, NaiveDateTime};
    use serde_json::json;
    use std::env;
    use std::fs;
    use std::path::PathBuf;

    struct StaticSource(Vec<ReadingBatch>);

    #[async_trait]
    impl ReadingsSource for StaticSource {
        async fn most_recent(&self, limit: usize) -> Result<Vec<ReadingBatch>> {
            Ok(self.0.iter().take(limit).cloned().collect())
        }

        async fn newest(&self) -> Result<Option<ReadingBatch>> {
            Ok(self.0.first().cloned())
        }

        async fn by_id(&self, batch_id: &str) -> Result<Option<ReadingBatch>> {
            Ok(self.0.iter().find(|b| b.batch_id == batch_id).cloned())
        }
    }

    fn schedule() -> Arc<ScheduleIndex> {
        let tables = ScheduleTables {
            stops: vec![StopRow {
                stop_id: "5".into(),
                stop_name: "Rynek".into(),
                stop_lat: 50.0400,
                stop_lon: 21.9990,
            }],
            trips: vec![TripRow {
                trip_id: "T1".into(),
                route_id: "10".into(),
                trip_headsign: Some("Dworzec".into()),
            }],
            stop_times: vec![StopTimeRow {
                trip_id: "T1".into(),
                stop_id: "5".into(),
                stop_sequence: 3,
                arrival_time: "08:00:00".into(),
            }],
            routes: vec![RouteRow {
                route_id: "10".into(),
                route_short_name: "10".into(),
                route_long_name: None,
            }],
        };
        Arc::new(ScheduleIndex::from_tables(tables).unwrap())
    }

    fn recorded_at() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 11, 3)
            .unwrap()
            .and_hms_opt(8, 3, 10)
            .unwrap()
    }

    fn on_trip_vehicle() -> serde_json::Value {
        json!({
            "vehicle_id": "bus42",
            "trip_id": "T1",
            "route_id": "10",
            "lat": 50.0401,
            "lon": 21.9991,
        })
    }

    fn engine_with(
        store_name: &str,
        batches: Vec<ReadingBatch>,
    ) -> (CorrelationEngine<StaticSource>, PathBuf) {
        let path = env::temp_dir().join(store_name);
        let _ = fs::remove_file(&path);
        let store = DelayStore::open(&path).unwrap();
        (
            CorrelationEngine::new(StaticSource(batches), store, schedule()),
            path,
        )
    }

    #[tokio::test]
    async fn test_skip_counting() {
        // 10 observations: 4 without a trip id, 6 on the trip
        let mut vehicles: Vec<serde_json::Value> = Vec::new();
        for _ in 0..4 {
            vehicles.push(json!({ "vehicle_id": "idle", "trip_id": "", "lat": 50.0, "lon": 22.0 }));
        }
        for i in 0..6 {
            let mut v = on_trip_vehicle();
            v["vehicle_id"] = json!(format!("bus{i}"));
            vehicles.push(v);
        }

        let batch = ReadingBatch {
            batch_id: "b1".into(),
            recorded_at: recorded_at(),
            feed_timestamp: None,
            vehicles,
        };
        let (engine, path) = engine_with("gtfs_delay_meter_engine_skips.csv", vec![]);

        let stats = engine.process_batch(&batch).unwrap();
        assert_eq!(stats.observations, 10);
        assert_eq!(stats.no_trip, 4);
        assert_eq!(stats.skipped, 4);
        // All six on-trip observations resolve to the same key
        assert_eq!(stats.matched, 1);
        assert_eq!(stats.already_present, 5);
        assert_eq!(stats.errored, 0);

        let _ = fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_processing_twice_is_idempotent() {
        let batch = ReadingBatch {
            batch_id: "b1".into(),
            recorded_at: recorded_at(),
            feed_timestamp: None,
            vehicles: vec![on_trip_vehicle()],
        };
        let (engine, path) = engine_with("gtfs_delay_meter_engine_idem.csv", vec![]);

        let first = engine.process_batch(&batch).unwrap();
        assert_eq!(first.matched, 1);
        assert_eq!(engine.store().len(), 1);

        let second = engine.process_batch(&batch).unwrap();
        assert_eq!(second.matched, 0);
        assert_eq!(second.already_present, 1);
        assert_eq!(engine.store().len(), 1);

        let _ = fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_defective_observation_counted_not_fatal() {
        let batch = ReadingBatch {
            batch_id: "b1".into(),
            recorded_at: recorded_at(),
            feed_timestamp: None,
            vehicles: vec![
                json!({ "trip_id": 12345, "lat": 50.0401, "lon": 21.9991 }),
                on_trip_vehicle(),
            ],
        };
        let (engine, path) = engine_with("gtfs_delay_meter_engine_defect.csv", vec![]);

        let stats = engine.process_batch(&batch).unwrap();
        assert_eq!(stats.errored, 1);
        assert_eq!(stats.matched, 1);

        let _ = fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_backfill_respects_limit() {
        let make_batch = |id: &str, minute: u32| ReadingBatch {
            batch_id: id.into(),
            recorded_at: NaiveDate::from_ymd_opt(2025, 11, 3)
                .unwrap()
                .and_hms_opt(8, minute, 0)
                .unwrap(),
            feed_timestamp: None,
            vehicles: vec![on_trip_vehicle()],
        };
        let batches = vec![make_batch("b3", 10), make_batch("b2", 5), make_batch("b1", 0)];
        let (engine, path) = engine_with("gtfs_delay_meter_engine_backfill.csv", batches);

        let stats = engine.backfill(2).await.unwrap();
        assert_eq!(stats.batches, 2);
        assert_eq!(stats.matched, 2);

        let _ = fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_continuous_observes_shutdown() {
        let batch = ReadingBatch {
            batch_id: "b1".into(),
            recorded_at: recorded_at(),
            feed_timestamp: None,
            vehicles: vec![on_trip_vehicle()],
        };
        let (engine, path) =
            engine_with("gtfs_delay_meter_engine_shutdown.csv", vec![batch]);

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            engine.run_continuous(Duration::from_secs(3600), rx).await
        });

        // Let the first cycle run, then cancel mid-sleep
        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(true).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("shutdown not observed within one tick")
            .unwrap();
        assert!(result.is_ok());

        let _ = fs::remove_file(&path);
    }
}
