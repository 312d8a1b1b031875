pub mod comms;
pub mod conditions;
pub mod distance;
pub mod gps_point;
pub mod serde_util;
pub mod trip_session;
pub mod validation;

use std::fmt;

use chrono::{DateTime, Utc};

#[derive(Debug, Clone, PartialEq)]
pub enum SessionError {
    OutOfRange { lat: f64, lng: f64 },
    NonMonotonic { previous: DateTime<Utc>, next: DateTime<Utc> },
    MissingStartTime,
    InvalidCoords(String),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::OutOfRange { lat, lng } => write!(f, "Coordinates out of range: {lat},{lng}"),
            SessionError::NonMonotonic { previous, next } => {
                write!(f, "Point recorded at {next} precedes the previous point at {previous}")
            }
            SessionError::MissingStartTime => write!(f, "Session has no start time and no GPS points to derive one from"),
            SessionError::InvalidCoords(raw) => write!(f, "Invalid coordinates: {raw:?}"),
        }
    }
}

impl std::error::Error for SessionError {}
