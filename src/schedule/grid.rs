//! Uniform grid index over stop coordinates for nearest-stop queries.
//!
//! The service area is a single city, so distance is approximated as
//! Euclidean degree distance scaled by a fixed meters-per-degree
//! constant instead of great-circle math.

use std::collections::HashMap;

/// Flat-earth conversion, valid at city scale in mid latitudes.
pub const METERS_PER_DEGREE: f64 = 111_000.0;

/// Cell edge in degrees, roughly 111 m.
const CELL_DEGREES: f64 = 0.001;

/// Spatial bucketing of points into fixed-size cells. Built once over
/// all stop coordinates; queries only visit the cells that can contain
/// a point within the given radius.
pub struct StopGrid {
    cells: HashMap<(i32, i32), Vec<usize>>,
    points: Vec<(f64, f64)>,
}

impl StopGrid {
    pub fn build(points: Vec<(f64, f64)>) -> Self {
        let mut cells: HashMap<(i32, i32), Vec<usize>> = HashMap::new();
        for (i, &(lat, lon)) in points.iter().enumerate() {
            cells.entry(cell_of(lat, lon)).or_default().push(i);
        }
        Self { cells, points }
    }

    /// Returns the index of the closest point within `max_distance_meters`
    /// of the query, with its distance, or `None` if the closest point
    /// exceeds that radius.
    pub fn nearest(&self, lat: f64, lon: f64, max_distance_meters: f64) -> Option<(usize, f64)> {
        let (cx, cy) = cell_of(lat, lon);
        // Any point within the radius lies at most this many cells away.
        let ring = (max_distance_meters / (CELL_DEGREES * METERS_PER_DEGREE)).ceil() as i32;

        let mut best: Option<(usize, f64)> = None;
        for dx in -ring..=ring {
            for dy in -ring..=ring {
                let Some(indices) = self.cells.get(&(cx + dx, cy + dy)) else {
                    continue;
                };
                for &i in indices {
                    let (p_lat, p_lon) = self.points[i];
                    let d = distance_meters(lat, lon, p_lat, p_lon);
                    if d <= max_distance_meters && best.is_none_or(|(_, b)| d < b) {
                        best = Some((i, d));
                    }
                }
            }
        }
        best
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

fn cell_of(lat: f64, lon: f64) -> (i32, i32) {
    (
        (lat / CELL_DEGREES).floor() as i32,
        (lon / CELL_DEGREES).floor() as i32,
    )
}

/// Euclidean degree distance scaled to meters.
pub fn distance_meters(a_lat: f64, a_lon: f64, b_lat: f64, b_lon: f64) -> f64 {
    let d_lat = a_lat - b_lat;
    let d_lon = a_lon - b_lon;
    (d_lat * d_lat + d_lon * d_lon).sqrt() * METERS_PER_DEGREE
}
