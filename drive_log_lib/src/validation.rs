use std::collections::BTreeMap;

use chrono::{DateTime, Datelike, Utc};

use crate::trip_session::TripSession;

pub const MIN_YEAR: i32 = 1900;
pub const MAX_YEAR: i32 = 2099;
pub const MIN_TRAVEL_DISTANCE_KM: f64 = 1.0;
pub const MAX_TRAVEL_DISTANCE_KM: f64 = 9999.0;

pub type ValidationErrors = BTreeMap<String, String>;

/// Checks a session the way the backend does before storing it.
///
/// A zero or absent distance is accepted here; storage substitutes the
/// minimum for it.
pub fn validate(session: &TripSession) -> Result<(), ValidationErrors> {
    let mut errors = ValidationErrors::new();

    let Some(start) = session.start_time else {
        errors.insert("start_datetime".into(), "The start date and time are required.".into());
        return Err(errors);
    };

    if session.stop_time.is_none() && session.gps_points().is_empty() {
        errors.insert(
            "stop_datetime".into(),
            "The stop date and time are required when no GPS points are provided.".into(),
        );
    }

    if let Some(distance) = session.travel_distance_km {
        if distance != 0.0 && !(MIN_TRAVEL_DISTANCE_KM..=MAX_TRAVEL_DISTANCE_KM).contains(&distance) {
            errors.insert(
                "travel_distance".into(),
                format!("Enter a valid distance ({MIN_TRAVEL_DISTANCE_KM} to {MAX_TRAVEL_DISTANCE_KM})."),
            );
        }
    }

    if !year_in_range(&start) {
        errors.insert("start_datetime".into(), format!("Dates must be between {MIN_YEAR} and {MAX_YEAR}."));
    }

    if let Some(stop) = effective_stop_time(session) {
        if !year_in_range(&stop) {
            errors.insert("stop_datetime".into(), format!("Dates must be between {MIN_YEAR} and {MAX_YEAR}."));
        }
        if start >= stop {
            errors.insert("datetime".into(), "The start must be before the stop.".into());
        }
    }

    if errors.is_empty() { Ok(()) } else { Err(errors) }
}

/// The stop time, or the time of the last fix when no stop was given.
pub fn effective_stop_time(session: &TripSession) -> Option<DateTime<Utc>> {
    session
        .stop_time
        .or_else(|| session.last_point().map(|point| point.recorded_at()))
}

fn year_in_range(timestamp: &DateTime<Utc>) -> bool {
    (MIN_YEAR..=MAX_YEAR).contains(&timestamp.year())
}
