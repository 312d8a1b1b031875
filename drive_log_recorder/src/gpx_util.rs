use std::{
    fs::File,
    io::{BufReader, BufWriter},
    path::Path,
    time::SystemTime,
};

use drive_log_lib::{gps_point::GpsPoint, serde_util::parse_timestamp, trip_session::TripSession};
use geo_types::Point;
use gpx::{Gpx, GpxVersion, Time, Track, TrackSegment, Waypoint};
use time::OffsetDateTime;

use crate::RecorderError;

/// Reads every timed track point of a GPX file, in file order.
///
/// Points without a timestamp cannot be replayed and are skipped, as are
/// points that would go back in time.
pub fn read_track(path: &Path) -> Result<Vec<GpsPoint>, RecorderError> {
    let file = File::open(path).map_err(|err| RecorderError::Config(format!("Failed to open {:?}: {err}", path)))?;
    let gpx = gpx::read(BufReader::new(file))
        .map_err(|err| RecorderError::Config(format!("Failed to parse {:?}: {err}", path)))?;

    let mut points: Vec<GpsPoint> = Vec::new();
    let mut skipped = 0;

    for track in gpx.tracks {
        for segment in track.segments {
            for waypoint in segment.points {
                let Some(recorded_at) = waypoint
                    .time
                    .and_then(|time| time.format().ok())
                    .and_then(|raw| parse_timestamp(&raw))
                else {
                    skipped += 1;
                    continue;
                };

                let position = waypoint.point();
                let Ok(point) = GpsPoint::new(position.y(), position.x(), recorded_at) else {
                    skipped += 1;
                    continue;
                };

                if points.last().is_some_and(|last| last.recorded_at() > point.recorded_at()) {
                    skipped += 1;
                    continue;
                }
                points.push(point);
            }
        }
    }

    if skipped > 0 {
        tracing::warn!("Skipped {skipped} unusable points in {:?}", path);
    }

    Ok(points)
}

/// Writes the trace of a session as a single-track GPX 1.1 file.
pub fn export_session(session: &TripSession, path: &Path) -> Result<(), RecorderError> {
    let mut gpx = Gpx {
        version: GpxVersion::Gpx11,
        ..Default::default()
    };

    let name = match session.id {
        Some(id) => format!("Trip {id}"),
        None => "Trip".to_string(),
    };
    gpx.metadata = Some(gpx::Metadata {
        name: Some(name),
        time: session.start_time.map(gpx_time),
        ..Default::default()
    });

    let mut track = Track::new();
    let mut segment = TrackSegment::new();

    for point in session.gps_points() {
        let mut waypoint = Waypoint::new(Point::new(point.lng(), point.lat()));
        waypoint.time = Some(gpx_time(point.recorded_at()));
        segment.points.push(waypoint);
    }

    track.segments.push(segment);
    gpx.tracks.push(track);

    let file = File::create(path).map_err(|err| RecorderError::Persistence(format!("Failed to create {:?}: {err}", path)))?;
    gpx::write(&gpx, BufWriter::new(file))
        .map_err(|err| RecorderError::Persistence(format!("Failed to write {:?}: {err}", path)))
}

fn gpx_time(timestamp: chrono::DateTime<chrono::Utc>) -> Time {
    let time: SystemTime = timestamp.into();
    let time: OffsetDateTime = time.into();
    Time::from(time)
}
