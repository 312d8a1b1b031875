use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::{
    conditions::Conditions,
    gps_point::{Coords, GpsPoint},
    serde_util, SessionError,
};

/// One recorded drive, in the shape the backend stores it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TripSession {
    #[serde(default, with = "serde_util::lenient_id")]
    pub id: Option<i64>,
    #[serde(rename = "start_datetime", default, with = "serde_util::optional_timestamp")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(rename = "stop_datetime", default, with = "serde_util::optional_timestamp")]
    pub stop_time: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "optional_coords")]
    pub start_coords: Option<Coords>,
    #[serde(default, deserialize_with = "optional_coords")]
    pub stop_coords: Option<Coords>,
    #[serde(rename = "travel_distance", default)]
    pub travel_distance_km: Option<f64>,
    #[serde(default)]
    pub nighttime: Option<bool>,
    #[serde(flatten)]
    pub conditions: Conditions,
    #[serde(default, deserialize_with = "serde_util::nullable_list::deserialize")]
    gps_points: Vec<GpsPoint>,

    /// Set while a session read back from local recovery state has not yet
    /// been confirmed by the server. Never written to the wire.
    #[serde(skip)]
    pub recovered: bool,
}

impl TripSession {
    pub fn begin(start_time: DateTime<Utc>) -> Self {
        Self {
            start_time: Some(serde_util::to_seconds(start_time)),
            ..Default::default()
        }
    }

    pub fn gps_points(&self) -> &[GpsPoint] {
        &self.gps_points
    }

    pub fn first_point(&self) -> Option<&GpsPoint> {
        self.gps_points.first()
    }

    pub fn last_point(&self) -> Option<&GpsPoint> {
        self.gps_points.last()
    }

    /// Appends to the trace. Points must not go back in time.
    pub fn push_point(&mut self, point: GpsPoint) -> Result<(), SessionError> {
        if let Some(last) = self.gps_points.last() {
            if point.recorded_at() < last.recorded_at() {
                return Err(SessionError::NonMonotonic {
                    previous: last.recorded_at(),
                    next: point.recorded_at(),
                });
            }
        }

        self.gps_points.push(point);
        Ok(())
    }

    pub fn with_gps_points(mut self, points: impl IntoIterator<Item = GpsPoint>) -> Result<Self, SessionError> {
        for point in points {
            self.push_point(point)?;
        }
        Ok(self)
    }

    pub fn is_closed(&self) -> bool {
        self.stop_time.is_some()
    }

    pub fn duration(&self) -> Option<TimeDelta> {
        Some(self.stop_time? - self.start_time?)
    }

    /// Time covered by the trace so far, measured from the session start.
    pub fn recorded_span(&self) -> Option<TimeDelta> {
        Some(self.last_point()?.recorded_at() - self.start_time?)
    }

    /// Start and stop coordinates come from the trace ends. A single point only
    /// gives a start.
    pub fn derive_endpoints(&mut self) {
        match self.gps_points.as_slice() {
            [] => {}
            [only] => self.start_coords = Some(only.coords()),
            [first, .., last] => {
                self.start_coords = Some(first.coords());
                self.stop_coords = Some(last.coords());
            }
        }
    }

    /// Turns a persisted session back into one that can keep recording.
    ///
    /// A missing start time falls back to the first point of the trace; with
    /// no trace either, the record cannot be resumed. Stop fields set by an
    /// earlier, unsynced stop are cleared so they get derived again.
    pub fn reopen(mut self) -> Result<Self, SessionError> {
        if self.start_time.is_none() {
            let first = self.first_point().ok_or(SessionError::MissingStartTime)?;
            self.start_time = Some(first.recorded_at());
        }

        self.stop_time = None;
        self.stop_coords = None;
        self.recovered = true;
        Ok(self)
    }
}

fn optional_coords<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Coords>, D::Error> {
    match Option::<serde_json::Value>::deserialize(deserializer)? {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::String(text)) if text.trim().is_empty() => Ok(None),
        Some(value) => serde_json::from_value(value).map(Some).map_err(serde::de::Error::custom),
    }
}
