use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use geo_types::Point;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{serde_util, SessionError};

pub fn is_valid_lat_lng(lat: f64, lng: f64) -> bool {
    lat.is_finite() && lng.is_finite() && (-90.0..=90.0).contains(&lat) && (-180.0..=180.0).contains(&lng)
}

/// A single timestamped fix. Fields are private so a point cannot change once built.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawGpsPoint")]
pub struct GpsPoint {
    lat: f64,
    lng: f64,
    #[serde(rename = "recordedAt", with = "serde_util::timestamp")]
    recorded_at: DateTime<Utc>,
}

impl GpsPoint {
    pub fn new(lat: f64, lng: f64, recorded_at: DateTime<Utc>) -> Result<Self, SessionError> {
        if !is_valid_lat_lng(lat, lng) {
            return Err(SessionError::OutOfRange { lat, lng });
        }

        Ok(Self {
            lat,
            lng,
            recorded_at: serde_util::to_seconds(recorded_at),
        })
    }

    pub fn lat(&self) -> f64 {
        self.lat
    }

    pub fn lng(&self) -> f64 {
        self.lng
    }

    pub fn recorded_at(&self) -> DateTime<Utc> {
        self.recorded_at
    }

    pub fn coords(&self) -> Coords {
        Coords { lat: self.lat, lng: self.lng }
    }

    /// x is longitude, y is latitude.
    pub fn position(&self) -> Point {
        Point::new(self.lng, self.lat)
    }
}

// Accepts both the client spelling and the backend's column names.
#[derive(Deserialize)]
struct RawGpsPoint {
    #[serde(alias = "latitude")]
    lat: f64,
    #[serde(alias = "longitude")]
    lng: f64,
    #[serde(rename = "recordedAt", alias = "recorded_at", with = "serde_util::timestamp")]
    recorded_at: DateTime<Utc>,
}

impl TryFrom<RawGpsPoint> for GpsPoint {
    type Error = SessionError;

    fn try_from(raw: RawGpsPoint) -> Result<Self, Self::Error> {
        GpsPoint::new(raw.lat, raw.lng, raw.recorded_at)
    }
}

/// A single location without a timestamp, written as `"lat,lng"` on the wire.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Coords {
    pub lat: f64,
    pub lng: f64,
}

impl Coords {
    pub fn new(lat: f64, lng: f64) -> Result<Self, SessionError> {
        if !is_valid_lat_lng(lat, lng) {
            return Err(SessionError::OutOfRange { lat, lng });
        }
        Ok(Self { lat, lng })
    }
}

impl fmt::Display for Coords {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.lat, self.lng)
    }
}

impl FromStr for Coords {
    type Err = SessionError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let Some((lat, lng)) = raw.split_once(',') else {
            return Err(SessionError::InvalidCoords(raw.to_string()));
        };

        let lat: f64 = lat.trim().parse().map_err(|_| SessionError::InvalidCoords(raw.to_string()))?;
        let lng: f64 = lng.trim().parse().map_err(|_| SessionError::InvalidCoords(raw.to_string()))?;

        Coords::new(lat, lng)
    }
}

impl Serialize for Coords {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Coords {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum RawCoords {
            Text(String),
            Object {
                #[serde(alias = "latitude")]
                lat: f64,
                #[serde(alias = "longitude")]
                lng: f64,
            },
        }

        match RawCoords::deserialize(deserializer)? {
            RawCoords::Text(text) => text.parse().map_err(serde::de::Error::custom),
            RawCoords::Object { lat, lng } => Coords::new(lat, lng).map_err(serde::de::Error::custom),
        }
    }
}
