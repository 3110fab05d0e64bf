//! Trailing-window delay reporting over persisted records.

use chrono::NaiveDateTime;
use serde::Serialize;
use std::collections::HashMap;
use tracing::info;

use crate::record::DelayRecord;

/// Mean delay for one grouping key (a route or a stop).
#[derive(Debug, Serialize)]
pub struct GroupStats {
    pub name: String,
    pub mean_delay_minutes: f64,
    pub samples: usize,
}

#[derive(Debug, Serialize)]
pub struct DelayReport {
    pub generated_at: NaiveDateTime,
    pub window_days: i64,
    pub total_records: usize,
    pub mean_delay_minutes: f64,
    pub stddev_delay_minutes: f64,
    pub min_delay_minutes: f64,
    pub max_delay_minutes: f64,
    pub worst_routes: Vec<GroupStats>,
    pub worst_stops: Vec<GroupStats>,
}

/// Computes the arithmetic mean of a slice of values. Returns 0.0 for empty input.
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Computes the population standard deviation given a pre-computed mean.
/// Returns 0.0 for empty input.
pub fn stddev(values: &[f64], mean: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;

    variance.sqrt()
}

/// Summarizes `records` (already filtered to the window) into overall
/// delay statistics and the ten worst routes and stops by mean delay.
/// Records without the grouping key are left out of that grouping.
pub fn build_report(
    records: &[DelayRecord],
    window_days: i64,
    generated_at: NaiveDateTime,
) -> DelayReport {
    let delays: Vec<f64> = records.iter().map(|r| r.delay_minutes).collect();
    let overall_mean = mean(&delays);
    let (min, max) = if delays.is_empty() {
        (0.0, 0.0)
    } else {
        (
            delays.iter().copied().fold(f64::INFINITY, f64::min),
            delays.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        )
    };

    let by_route = group_means(records, |r| r.route_short_name.as_deref());
    let by_stop = group_means(records, |r| r.stop_name.as_deref());

    DelayReport {
        generated_at,
        window_days,
        total_records: records.len(),
        mean_delay_minutes: overall_mean,
        stddev_delay_minutes: stddev(&delays, overall_mean),
        min_delay_minutes: min,
        max_delay_minutes: max,
        worst_routes: top_ten(by_route),
        worst_stops: top_ten(by_stop),
    }
}

fn group_means<'a>(
    records: &'a [DelayRecord],
    key: impl Fn(&'a DelayRecord) -> Option<&'a str>,
) -> HashMap<&'a str, Vec<f64>> {
    let mut series: HashMap<&str, Vec<f64>> = HashMap::new();
    for record in records {
        if let Some(name) = key(record) {
            series.entry(name).or_default().push(record.delay_minutes);
        }
    }
    series
}

fn top_ten(series: HashMap<&str, Vec<f64>>) -> Vec<GroupStats> {
    let mut groups: Vec<GroupStats> = series
        .into_iter()
        .map(|(name, delays)| GroupStats {
            name: name.to_string(),
            mean_delay_minutes: mean(&delays),
            samples: delays.len(),
        })
        .collect();
    groups.sort_by(|a, b| {
        b.mean_delay_minutes
            .partial_cmp(&a.mean_delay_minutes)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    groups.truncate(10);
    groups
}

/// Logs the report as structured info lines.
pub fn log_report(report: &DelayReport) {
    info!(
        window_days = report.window_days,
        total_records = report.total_records,
        mean_delay_minutes = report.mean_delay_minutes,
        stddev_delay_minutes = report.stddev_delay_minutes,
        min_delay_minutes = report.min_delay_minutes,
        max_delay_minutes = report.max_delay_minutes,
        "Delay report"
    );

    for route in &report.worst_routes {
        info!(
            route = %route.name,
            mean_delay_minutes = route.mean_delay_minutes,
            samples = route.samples,
            "Worst route"
        );
    }
    for stop in &report.worst_stops {
        info!(
            stop = %stop.name,
            mean_delay_minutes = stop.mean_delay_minutes,
            samples = stop.samples,
            "Worst stop"
        );
    }
}

/// Logs the report as pretty-printed JSON.
pub fn print_json(report: &DelayReport) -> anyhow::Result<()> {
    info!("{}", serde_json::to_string_pretty(report)?);
    Ok(())
}
