use std::collections::BTreeMap;

use drive_log_lib::{
    trip_session::TripSession,
    validation::{self, MIN_TRAVEL_DISTANCE_KM, ValidationErrors},
};
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Saved {
    Created,
    Updated,
}

#[derive(Default)]
struct Sessions {
    next_id: i64,
    by_id: BTreeMap<i64, TripSession>,
}

/// In-memory session store behind the HTTP routes.
#[derive(Default)]
pub struct ServerState {
    sessions: Mutex<Sessions>,
}

impl ServerState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a session, updating in place when its id is already known.
    pub async fn save(&self, mut session: TripSession) -> Result<(TripSession, Saved), ValidationErrors> {
        normalize(&mut session);
        validation::validate(&session)?;
        session.recovered = false;

        let mut sessions = self.sessions.lock().await;
        let saved = match session.id {
            Some(id) if sessions.by_id.contains_key(&id) => Saved::Updated,
            _ => {
                sessions.next_id += 1;
                session.id = Some(sessions.next_id);
                Saved::Created
            }
        };

        if let Some(id) = session.id {
            sessions.by_id.insert(id, session.clone());
        }
        Ok((session, saved))
    }

    pub async fn get(&self, id: i64) -> Option<TripSession> {
        self.sessions.lock().await.by_id.get(&id).cloned()
    }

    pub async fn delete(&self, id: i64) -> bool {
        self.sessions.lock().await.by_id.remove(&id).is_some()
    }

    /// Newest first.
    pub async fn all(&self) -> Vec<TripSession> {
        let mut all: Vec<TripSession> = self.sessions.lock().await.by_id.values().cloned().collect();
        all.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        all
    }

    pub async fn total_distance(&self) -> f64 {
        self.sessions
            .lock()
            .await
            .by_id
            .values()
            .filter_map(|session| session.travel_distance_km)
            .sum()
    }
}

/// Fills what the client may leave out: the stop time from the trace, the
/// endpoints from the trace and the minimum distance.
fn normalize(session: &mut TripSession) {
    if session.stop_time.is_none() {
        session.stop_time = validation::effective_stop_time(session);
    }
    if session.start_coords.is_none() || session.stop_coords.is_none() {
        let (start, stop) = (session.start_coords, session.stop_coords);
        session.derive_endpoints();
        session.start_coords = start.or(session.start_coords);
        session.stop_coords = stop.or(session.stop_coords);
    }
    if session.travel_distance_km.is_none_or(|distance| distance == 0.0) {
        session.travel_distance_km = Some(MIN_TRAVEL_DISTANCE_KM);
    }
}
