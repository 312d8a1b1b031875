use geo::{Distance, Haversine};

use crate::gps_point::GpsPoint;

/// Great-circle distance between two fixes in kilometres.
pub fn segment_km(from: &GpsPoint, to: &GpsPoint) -> f64 {
    Haversine.distance(from.position(), to.position()) / 1000.0
}

/// Length of the path through `points` in kilometres, following them in order.
///
/// This is a path length, not the distance between the endpoints. Fewer than
/// two points give 0.
pub fn cumulative_distance(points: &[GpsPoint]) -> f64 {
    points
        .windows(2)
        .map(|pair| segment_km(&pair[0], &pair[1]))
        .sum()
}

/// Rounds to the nearest multiple of `step` kilometres. A non-positive step
/// leaves the value untouched.
pub fn round_km(distance_km: f64, step: f64) -> f64 {
    if step > 0.0 {
        (distance_km / step).round() * step
    } else {
        distance_km
    }
}
