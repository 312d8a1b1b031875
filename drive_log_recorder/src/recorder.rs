use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use drive_log_lib::{
    SessionError, distance::cumulative_distance, gps_point::GpsPoint, trip_session::TripSession,
};
use tracing::{debug, error, info, warn};

use crate::{
    RecorderError,
    clock::Clock,
    config::{DistancePolicy, RecorderConfig, TransportContext},
    position::{PositionError, PositionEvent, PositionFeed, PositionOptions, PositionSample, PositionSource},
    store::{PersistedSession, PersistentStore, SessionPhase, SessionRepository},
    sync::SessionSync,
    wake_lock::WakeLockManager,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RecorderState {
    #[default]
    Idle,
    Recording,
    Stopping,
}

/// The caller's answer to "there is an unfinished trip" at start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryChoice {
    Resume,
    Discard,
}

/// Snapshot for the live counter.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordingStatus {
    pub state: RecorderState,
    pub start_time: Option<DateTime<Utc>>,
    pub elapsed: TimeDelta,
    pub distance_km: f64,
    pub points: usize,
    pub recovered: bool,
    /// Why the last recording ended without a stop, if it did.
    pub interruption: Option<String>,
}

struct Resumption {
    at: DateTime<Utc>,
    span: TimeDelta,
}

struct ActiveRecording {
    session: TripSession,
    feed: PositionFeed,
    resumed: Option<Resumption>,
}

/// Owns the trip being recorded, from start to the backend's confirmation.
///
/// At most one recording exists per recorder. Every accepted sample is
/// persisted before the next one is looked at, so an interrupted trip can be
/// resumed from its last point.
pub struct TripRecorder {
    source: Arc<dyn PositionSource>,
    repository: SessionRepository,
    sync: Arc<dyn SessionSync>,
    wake_lock: WakeLockManager,
    clock: Arc<dyn Clock>,
    options: PositionOptions,
    distance_policy: DistancePolicy,
    transport: TransportContext,
    state: RecorderState,
    active: Option<ActiveRecording>,
    interruption: Option<String>,
}

impl TripRecorder {
    pub fn new(
        source: Arc<dyn PositionSource>,
        store: Arc<dyn PersistentStore>,
        sync: Arc<dyn SessionSync>,
        wake_lock: WakeLockManager,
        clock: Arc<dyn Clock>,
        config: &RecorderConfig,
    ) -> Self {
        Self {
            source,
            repository: SessionRepository::new(store),
            sync,
            wake_lock,
            clock,
            options: config.position.options(),
            distance_policy: config.distance.clone(),
            transport: config.transport_context(),
            state: RecorderState::Idle,
            active: None,
            interruption: None,
        }
    }

    pub fn state(&self) -> RecorderState {
        self.state
    }

    pub fn is_recording(&self) -> bool {
        self.state == RecorderState::Recording
    }

    /// The trip being recorded.
    pub fn session(&self) -> Option<&TripSession> {
        self.active.as_ref().map(|active| &active.session)
    }

    /// An interrupted or unsynced trip that `start` would offer to resume.
    pub async fn pending_recovery(&self) -> Result<Option<PersistedSession>, RecorderError> {
        self.repository.recoverable().await
    }

    /// The most recent trip, synced or not.
    pub async fn last_trip(&self) -> Result<Option<TripSession>, RecorderError> {
        self.repository.last_trip().await
    }

    pub async fn start(&mut self, choice: RecoveryChoice) -> Result<RecordingStatus, RecorderError> {
        if self.state != RecorderState::Idle {
            return Err(RecorderError::AlreadyRecording);
        }

        if self.source.requires_secure_context() && self.transport == TransportContext::Insecure {
            return Err(RecorderError::Precondition(
                "the position feed needs a secure connection to the server".into(),
            ));
        }

        let now = self.clock.now();
        let (session, resumed) = match choice {
            RecoveryChoice::Resume => match self.repository.recoverable().await? {
                Some(record) => {
                    let session = record.session.reopen()?;
                    let span = session.recorded_span().unwrap_or_default().max(TimeDelta::zero());
                    info!("Resuming {:?} trip with {} points", record.phase, session.gps_points().len());
                    (session, Some(Resumption { at: now, span }))
                }
                None => (TripSession::begin(now), None),
            },
            RecoveryChoice::Discard => (TripSession::begin(now), None),
        };

        if let Err(err) = self.wake_lock.acquire().await {
            warn!("Recording without wake lock: {err}");
        }

        let feed = match self.source.subscribe(&self.options).await {
            Ok(feed) => feed,
            Err(err) => {
                self.wake_lock.release().await;
                return Err(RecorderError::PositionUnavailable(err.to_string()));
            }
        };

        if let Err(err) = self.repository.save(SessionPhase::Recording, &session).await {
            self.source.unsubscribe(feed.id).await;
            self.wake_lock.release().await;
            return Err(err);
        }

        info!("Recording started at {:?}", session.start_time);
        self.interruption = None;
        self.state = RecorderState::Recording;
        self.active = Some(ActiveRecording {
            session,
            feed,
            resumed,
        });

        Ok(self.status(now))
    }

    /// Waits for the next event of the active feed. Never resolves while no
    /// trip is being recorded.
    pub async fn next_position_event(&mut self) -> PositionEvent {
        match self.active.as_mut() {
            Some(active) => active
                .feed
                .next()
                .await
                .unwrap_or_else(|| PositionEvent::Error(PositionError::Unavailable("the position feed closed".into()))),
            None => std::future::pending().await,
        }
    }

    /// Applies one feed event. Only a fatal feed failure is returned as an
    /// error, after the recording has been ended.
    pub async fn handle_position_event(&mut self, event: PositionEvent) -> Result<(), RecorderError> {
        if self.state != RecorderState::Recording {
            debug!("Dropping position event received while {:?}", self.state);
            return Ok(());
        }

        match event {
            PositionEvent::Sample(sample) => {
                self.record_sample(sample).await;
                Ok(())
            }
            PositionEvent::Error(PositionError::Timeout) => {
                warn!("{}, still waiting", RecorderError::SampleTimeout);
                Ok(())
            }
            PositionEvent::Error(err) => {
                let reason = err.to_string();
                self.abort(&reason).await;
                Err(RecorderError::PositionUnavailable(reason))
            }
        }
    }

    async fn record_sample(&mut self, sample: PositionSample) {
        let now = self.clock.now();
        let Some(active) = self.active.as_mut() else {
            return;
        };

        if (now - sample.timestamp).to_std().is_ok_and(|age| age > self.options.maximum_age) {
            warn!("Dropping stale sample from {}", sample.timestamp);
            return;
        }

        if !self.options.accepts(&sample) {
            warn!("Dropping coarse sample ({:?} m)", sample.accuracy_m);
            return;
        }

        let point = match GpsPoint::new(sample.lat, sample.lng, sample.timestamp) {
            Ok(point) => point,
            Err(err) => {
                warn!("Dropping sample: {err}");
                return;
            }
        };

        if let Err(err) = active.session.push_point(point) {
            warn!("Dropping sample: {err}");
            return;
        }

        if let Err(err) = self.repository.save(SessionPhase::Recording, &active.session).await {
            error!("Sample kept in memory only: {err}");
        }
    }

    /// Ends a recording the feed gave up on. The record is kept for recovery
    /// unless there is nothing in it.
    async fn abort(&mut self, reason: &str) {
        let Some(active) = self.active.take() else {
            return;
        };

        self.source.unsubscribe(active.feed.id).await;
        self.wake_lock.release().await;
        self.state = RecorderState::Idle;

        if active.session.gps_points().is_empty() && !active.session.recovered {
            if let Err(err) = self.repository.clear().await {
                error!("Failed to remove empty recovery record: {err}");
            }
        }

        warn!("Recording interrupted: {reason}");
        self.interruption = Some(reason.to_string());
    }

    /// Lets go of the feed and the wake lock but leaves the record in place,
    /// the same as if the process had been killed.
    pub async fn suspend(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };

        self.source.unsubscribe(active.feed.id).await;
        self.wake_lock.release().await;
        self.state = RecorderState::Idle;
        info!("Recording suspended with {} points", active.session.gps_points().len());
    }

    /// Closes the trip and hands it to the backend. Returns the backend's
    /// copy. When the backend cannot be reached the trip stays on disk for
    /// `retry_sync` or a later `start`.
    pub async fn stop(&mut self) -> Result<TripSession, RecorderError> {
        if self.state != RecorderState::Recording {
            return Err(RecorderError::NotRecording);
        }
        let Some(feed_id) = self.active.as_ref().map(|active| active.feed.id) else {
            self.state = RecorderState::Idle;
            return Err(RecorderError::NotRecording);
        };

        self.source.unsubscribe(feed_id).await;
        self.drain_feed().await;

        let Some(ActiveRecording { session, .. }) = self.active.take() else {
            self.state = RecorderState::Idle;
            return Err(RecorderError::NotRecording);
        };

        self.state = RecorderState::Stopping;
        self.wake_lock.release().await;

        let result = self.close_and_submit(session).await;
        self.state = RecorderState::Idle;
        result
    }

    /// Records the samples the feed delivered before it was cancelled. Only
    /// called once the subscription is gone, so the queue is finite.
    async fn drain_feed(&mut self) {
        loop {
            let Some(active) = self.active.as_mut() else {
                return;
            };
            let Ok(event) = active.feed.events.try_recv() else {
                return;
            };

            match event {
                PositionEvent::Sample(sample) => self.record_sample(sample).await,
                PositionEvent::Error(err) => debug!("Ignoring feed error queued before stop: {err}"),
            }
        }
    }

    async fn close_and_submit(&self, mut session: TripSession) -> Result<TripSession, RecorderError> {
        let start = session.start_time.ok_or(SessionError::MissingStartTime)?;
        session.stop_time = Some(self.clock.now().max(start + TimeDelta::seconds(1)));
        session.derive_endpoints();
        let distance = self.finalize_distance(&mut session);

        info!(
            "Recording stopped after {:?} with {} points",
            session.duration(),
            session.gps_points().len()
        );

        if let Err(err) = self.repository.save(SessionPhase::AwaitingSync, &session).await {
            error!("Stopped trip is not stored locally: {err}");
        }

        distance?;
        self.submit(session).await
    }

    /// Distance from the trace, when it has at least two points.
    fn finalize_distance(&self, session: &mut TripSession) -> Result<(), RecorderError> {
        if session.gps_points().len() < 2 {
            return Ok(());
        }

        let measured = cumulative_distance(session.gps_points());
        match self.distance_policy.apply(measured) {
            Ok(distance) => {
                session.travel_distance_km = Some(distance);
                Ok(())
            }
            Err(err) => {
                session.travel_distance_km = Some(measured);
                Err(err)
            }
        }
    }

    async fn submit(&self, session: TripSession) -> Result<TripSession, RecorderError> {
        match self.sync.submit(&session).await {
            Ok(mut stored) => {
                stored.recovered = false;
                if let Err(err) = self.repository.save(SessionPhase::Synced, &stored).await {
                    warn!("Trip synced but the local copy could not be updated: {err}");
                    if let Err(err) = self.repository.clear().await {
                        error!("Synced trip may be offered again: {err}");
                    }
                }

                info!("Trip synced with id {:?}", stored.id);
                Ok(stored)
            }
            Err(err) => {
                warn!("Trip kept locally after failed sync: {err}");
                Err(err.into())
            }
        }
    }

    /// Submits the stopped but unsynced trip again.
    pub async fn retry_sync(&mut self) -> Result<TripSession, RecorderError> {
        if self.state != RecorderState::Idle {
            return Err(RecorderError::AlreadyRecording);
        }

        let mut session = match self.repository.load().await? {
            Some(record) if record.phase == SessionPhase::AwaitingSync => record.session,
            Some(record) if record.phase == SessionPhase::Recording => {
                return Err(RecorderError::Precondition(
                    "the last trip was interrupted before it was stopped, resume it first".into(),
                ));
            }
            _ => return Err(RecorderError::Precondition("there is no unsynced trip".into())),
        };

        self.finalize_distance(&mut session)?;
        self.submit(session).await
    }

    /// Drops an interrupted or unsynced trip without submitting it. Returns
    /// whether there was one.
    pub async fn discard_pending(&mut self) -> Result<bool, RecorderError> {
        if self.state != RecorderState::Idle {
            return Err(RecorderError::AlreadyRecording);
        }

        let pending = match self.repository.load().await {
            Ok(record) => record.is_some_and(|record| record.is_recoverable()),
            Err(RecorderError::Validation(err)) => {
                warn!("Discarding unreadable recovery record: {err}");
                true
            }
            Err(err) => return Err(err),
        };

        if pending {
            self.repository.clear().await?;
            info!("Discarded unsynced trip");
        }

        Ok(pending)
    }

    pub fn status(&self, now: DateTime<Utc>) -> RecordingStatus {
        let Some(active) = &self.active else {
            return RecordingStatus {
                state: self.state,
                interruption: self.interruption.clone(),
                ..Default::default()
            };
        };

        let session = &active.session;
        let elapsed = match &active.resumed {
            Some(resumed) => resumed.span + (now - resumed.at),
            None => session.start_time.map(|start| now - start).unwrap_or_default(),
        };

        RecordingStatus {
            state: self.state,
            start_time: session.start_time,
            elapsed: elapsed.max(TimeDelta::zero()),
            distance_km: cumulative_distance(session.gps_points()),
            points: session.gps_points().len(),
            recovered: session.recovered,
            interruption: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        RECOVERY_KEY,
        clock::ManualClock,
        config::{DistanceFloor, TransportMode},
        position::ChannelPositionSource,
        store::MemoryStore,
        sync::SyncError,
        wake_lock::{WakeLockBackend, WakeLockError},
    };
    use async_trait::async_trait;
    use chrono::TimeZone;
    use drive_log_lib::gps_point::Coords;
    use std::sync::{
        Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    };

    const EARTH_RADIUS_KM: f64 = 6371.0088;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap()
    }

    fn at(secs: i64) -> DateTime<Utc> {
        t0() + TimeDelta::seconds(secs)
    }

    /// Latitude `km` kilometres north of 45°N along a meridian.
    fn lat_after_km(km: f64) -> f64 {
        45.0 + (km / EARTH_RADIUS_KM).to_degrees()
    }

    #[derive(Default)]
    struct FakeSync {
        offline: AtomicBool,
        submitted: Mutex<Vec<TripSession>>,
    }

    #[async_trait]
    impl SessionSync for FakeSync {
        async fn submit(&self, session: &TripSession) -> Result<TripSession, SyncError> {
            self.submitted.lock().unwrap().push(session.clone());
            if self.offline.load(Ordering::SeqCst) {
                return Err(SyncError::Transport("connection refused".into()));
            }

            let mut stored = session.clone();
            stored.id.get_or_insert(7);
            Ok(stored)
        }

        async fn get_session(&self, _id: i64) -> Result<TripSession, SyncError> {
            Err(SyncError::Decode("not used".into()))
        }

        async fn delete_session(&self, _id: i64) -> Result<(), SyncError> {
            Err(SyncError::Decode("not used".into()))
        }

        async fn all_sessions(&self) -> Result<Vec<TripSession>, SyncError> {
            Ok(self.submitted.lock().unwrap().clone())
        }

        async fn total_distance(&self) -> Result<f64, SyncError> {
            Ok(0.0)
        }
    }

    #[derive(Clone, Default)]
    struct CountingLock {
        acquired: Arc<AtomicUsize>,
        released: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl WakeLockBackend for CountingLock {
        async fn acquire(&mut self) -> Result<(), WakeLockError> {
            self.acquired.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn release(&mut self) -> Result<(), WakeLockError> {
            self.released.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Fixture {
        source: ChannelPositionSource,
        store: MemoryStore,
        sync: Arc<FakeSync>,
        clock: ManualClock,
        lock: CountingLock,
        config: RecorderConfig,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                source: ChannelPositionSource::new(),
                store: MemoryStore::new(),
                sync: Arc::new(FakeSync::default()),
                clock: ManualClock::new(t0()),
                lock: CountingLock::default(),
                config: RecorderConfig {
                    server_url: "https://log.example".into(),
                    ..Default::default()
                },
            }
        }

        fn recorder(&self) -> TripRecorder {
            TripRecorder::new(
                Arc::new(self.source.clone()),
                Arc::new(self.store.clone()),
                self.sync.clone(),
                WakeLockManager::new(Box::new(self.lock.clone())),
                Arc::new(self.clock.clone()),
                &self.config,
            )
        }

        fn repository(&self) -> SessionRepository {
            SessionRepository::new(Arc::new(self.store.clone()))
        }

        /// Moves the clock to `secs`, delivers a sample stamped then and lets
        /// the recorder process it.
        async fn sample(&self, recorder: &mut TripRecorder, lat: f64, lng: f64, secs: i64) {
            self.clock.set(at(secs));
            assert!(self.source.push_sample(PositionSample::new(lat, lng, at(secs))).await);
            let event = recorder.next_position_event().await;
            recorder.handle_position_event(event).await.unwrap();
        }
    }

    #[tokio::test]
    async fn straight_two_km_trip() {
        let fixture = Fixture::new();
        let mut recorder = fixture.recorder();

        recorder.start(RecoveryChoice::Resume).await.unwrap();
        assert_eq!(recorder.state(), RecorderState::Recording);
        assert!(fixture.source.is_subscribed().await);

        fixture.sample(&mut recorder, lat_after_km(0.0), 5.0, 0).await;
        fixture.sample(&mut recorder, lat_after_km(1.0), 5.0, 60).await;
        fixture.sample(&mut recorder, lat_after_km(2.0), 5.0, 120).await;

        let stored = recorder.stop().await.unwrap();
        assert_eq!(recorder.state(), RecorderState::Idle);
        assert!(!fixture.source.is_subscribed().await);

        assert_eq!(stored.id, Some(7));
        assert_eq!(stored.travel_distance_km, Some(2.0));
        assert_eq!(stored.start_time, Some(at(0)));
        assert_eq!(stored.stop_time, Some(at(120)));
        assert_eq!(stored.start_coords, Some(Coords::new(lat_after_km(0.0), 5.0).unwrap()));
        assert_eq!(stored.stop_coords, Some(Coords::new(lat_after_km(2.0), 5.0).unwrap()));
        assert_eq!(fixture.sync.submitted.lock().unwrap().len(), 1);

        let record = fixture.repository().load().await.unwrap().unwrap();
        assert_eq!(record.phase, SessionPhase::Synced);
        assert_eq!(record.session, stored);
        assert_eq!(recorder.pending_recovery().await.unwrap(), None);
        assert_eq!(recorder.last_trip().await.unwrap(), Some(stored));

        assert_eq!(fixture.lock.acquired.load(Ordering::SeqCst), 1);
        assert_eq!(fixture.lock.released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stop_without_samples() {
        let fixture = Fixture::new();
        let mut recorder = fixture.recorder();

        recorder.start(RecoveryChoice::Resume).await.unwrap();
        let stored = recorder.stop().await.unwrap();

        assert_eq!(stored.travel_distance_km, None);
        assert_eq!(stored.start_coords, None);
        assert_eq!(stored.stop_coords, None);
        assert_eq!(stored.stop_time, Some(at(1)));
    }

    #[tokio::test]
    async fn single_sample_only_sets_start_coords() {
        let fixture = Fixture::new();
        let mut recorder = fixture.recorder();

        recorder.start(RecoveryChoice::Resume).await.unwrap();
        fixture.sample(&mut recorder, 48.0, 2.0, 30).await;
        let stored = recorder.stop().await.unwrap();

        assert_eq!(stored.start_coords, Some(Coords::new(48.0, 2.0).unwrap()));
        assert_eq!(stored.stop_coords, None);
        assert_eq!(stored.travel_distance_km, None);
    }

    #[tokio::test]
    async fn second_start_is_refused() {
        let fixture = Fixture::new();
        let mut recorder = fixture.recorder();

        recorder.start(RecoveryChoice::Resume).await.unwrap();
        fixture.sample(&mut recorder, 48.0, 2.0, 10).await;

        assert_eq!(
            recorder.start(RecoveryChoice::Discard).await,
            Err(RecorderError::AlreadyRecording)
        );
        assert_eq!(recorder.session().unwrap().gps_points().len(), 1);
        assert!(recorder.is_recording());
    }

    #[tokio::test]
    async fn insecure_transport_is_a_precondition_failure() {
        let mut fixture = Fixture::new();
        fixture.config.transport = TransportMode::Insecure;
        let mut recorder = fixture.recorder();

        assert!(matches!(
            recorder.start(RecoveryChoice::Resume).await,
            Err(RecorderError::Precondition(_))
        ));
        assert_eq!(recorder.state(), RecorderState::Idle);
        assert_eq!(fixture.store.get(RECOVERY_KEY).await.unwrap(), None);
    }

    #[tokio::test]
    async fn refused_subscription_leaves_nothing_behind() {
        let fixture = Fixture::new();
        fixture.source.deny_permission().await;
        let mut recorder = fixture.recorder();

        assert!(matches!(
            recorder.start(RecoveryChoice::Resume).await,
            Err(RecorderError::PositionUnavailable(_))
        ));
        assert_eq!(recorder.state(), RecorderState::Idle);
        assert_eq!(fixture.store.get(RECOVERY_KEY).await.unwrap(), None);
        assert_eq!(fixture.lock.released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn permission_denied_after_start() {
        let fixture = Fixture::new();
        let mut recorder = fixture.recorder();

        recorder.start(RecoveryChoice::Resume).await.unwrap();
        assert!(fixture.store.get(RECOVERY_KEY).await.unwrap().is_some());

        fixture.source.push_error(PositionError::PermissionDenied).await;
        let event = recorder.next_position_event().await;
        let result = recorder.handle_position_event(event).await;

        assert!(matches!(result, Err(RecorderError::PositionUnavailable(_))));
        assert_eq!(recorder.state(), RecorderState::Idle);
        assert_eq!(fixture.store.get(RECOVERY_KEY).await.unwrap(), None);
        assert!(!fixture.source.is_subscribed().await);
        assert!(recorder.status(at(5)).interruption.is_some());
    }

    #[tokio::test]
    async fn closed_feed_keeps_recorded_points() {
        let fixture = Fixture::new();
        let mut recorder = fixture.recorder();

        recorder.start(RecoveryChoice::Resume).await.unwrap();
        fixture.sample(&mut recorder, 48.0, 2.0, 10).await;
        fixture.source.close().await;

        let event = recorder.next_position_event().await;
        assert!(recorder.handle_position_event(event).await.is_err());

        let pending = recorder.pending_recovery().await.unwrap().unwrap();
        assert_eq!(pending.phase, SessionPhase::Recording);
        assert_eq!(pending.session.gps_points().len(), 1);
    }

    #[tokio::test]
    async fn timeout_keeps_recording() {
        let fixture = Fixture::new();
        let mut recorder = fixture.recorder();

        recorder.start(RecoveryChoice::Resume).await.unwrap();
        fixture.source.push_error(PositionError::Timeout).await;
        let event = recorder.next_position_event().await;

        assert_eq!(recorder.handle_position_event(event).await, Ok(()));
        assert!(recorder.is_recording());
        fixture.sample(&mut recorder, 48.0, 2.0, 20).await;
        assert_eq!(recorder.status(at(20)).points, 1);
    }

    #[tokio::test]
    async fn drops_unusable_samples() {
        let fixture = Fixture::new();
        let mut recorder = fixture.recorder();
        recorder.start(RecoveryChoice::Resume).await.unwrap();

        fixture.sample(&mut recorder, 48.0, 2.0, 50).await;
        // Out of range.
        fixture.sample(&mut recorder, 95.0, 2.0, 60).await;
        // Older than the previous point.
        fixture.clock.set(at(52));
        fixture.source.push_sample(PositionSample::new(48.1, 2.0, at(45))).await;
        let event = recorder.next_position_event().await;
        recorder.handle_position_event(event).await.unwrap();
        // Stale.
        fixture.clock.set(at(100));
        fixture.source.push_sample(PositionSample::new(48.2, 2.0, at(80))).await;
        let event = recorder.next_position_event().await;
        recorder.handle_position_event(event).await.unwrap();
        // Too coarse for a high accuracy feed.
        fixture
            .source
            .push_sample(PositionSample::new(48.3, 2.0, at(100)).with_accuracy(2_000.0))
            .await;
        let event = recorder.next_position_event().await;
        recorder.handle_position_event(event).await.unwrap();

        let session = recorder.session().unwrap();
        assert_eq!(session.gps_points().len(), 1);
        assert_eq!(session.gps_points()[0].lat(), 48.0);
    }

    #[tokio::test]
    async fn stop_keeps_samples_still_queued_in_the_feed() {
        let fixture = Fixture::new();
        let mut recorder = fixture.recorder();
        recorder.start(RecoveryChoice::Resume).await.unwrap();

        fixture.clock.set(at(120));
        for (secs, km) in [(110, 0.0), (115, 1.0), (120, 2.0)] {
            assert!(
                fixture
                    .source
                    .push_sample(PositionSample::new(lat_after_km(km), 5.0, at(secs)))
                    .await
            );
        }
        fixture.source.push_error(PositionError::Timeout).await;

        let stored = recorder.stop().await.unwrap();
        assert_eq!(stored.gps_points().len(), 3);
        assert_eq!(stored.stop_coords, Some(Coords::new(lat_after_km(2.0), 5.0).unwrap()));
        assert_eq!(stored.travel_distance_km, Some(2.0));
        assert!(!fixture.source.push_sample(PositionSample::new(48.0, 2.0, at(121))).await);
    }

    #[tokio::test]
    async fn every_sample_is_persisted() {
        let fixture = Fixture::new();
        let mut recorder = fixture.recorder();
        recorder.start(RecoveryChoice::Resume).await.unwrap();

        for (i, lat) in [48.0, 48.01, 48.02].into_iter().enumerate() {
            fixture.sample(&mut recorder, lat, 2.0, 10 * i as i64).await;
            let record = fixture.repository().load().await.unwrap().unwrap();
            assert_eq!(record.session.gps_points().len(), i + 1);
        }
    }

    #[tokio::test]
    async fn resumes_interrupted_trip_in_order() {
        let fixture = Fixture::new();
        let mut first = fixture.recorder();
        first.start(RecoveryChoice::Resume).await.unwrap();
        fixture.sample(&mut first, 48.0, 2.0, 0).await;
        fixture.sample(&mut first, 48.01, 2.0, 60).await;
        fixture.sample(&mut first, 48.02, 2.0, 120).await;
        let before = first.session().unwrap().gps_points().to_vec();
        first.suspend().await;
        drop(first);

        fixture.clock.set(at(600));
        let mut second = fixture.recorder();
        let pending = second.pending_recovery().await.unwrap().unwrap();
        assert_eq!(pending.phase, SessionPhase::Recording);

        let status = second.start(RecoveryChoice::Resume).await.unwrap();
        assert!(status.recovered);
        assert_eq!(status.start_time, Some(at(0)));
        assert_eq!(second.session().unwrap().gps_points(), before.as_slice());

        // The counter continues from the last recorded point.
        assert_eq!(second.status(at(610)).elapsed, TimeDelta::seconds(130));

        fixture.sample(&mut second, 48.03, 2.0, 615).await;
        let stored = second.stop().await.unwrap();
        assert_eq!(stored.gps_points().len(), 4);
        assert!(!stored.recovered);
    }

    #[tokio::test]
    async fn failed_sync_keeps_trip_for_retry() {
        let fixture = Fixture::new();
        fixture.sync.offline.store(true, Ordering::SeqCst);
        let mut recorder = fixture.recorder();

        recorder.start(RecoveryChoice::Resume).await.unwrap();
        fixture.sample(&mut recorder, lat_after_km(0.0), 5.0, 0).await;
        fixture.sample(&mut recorder, lat_after_km(1.0), 5.0, 60).await;

        assert!(matches!(recorder.stop().await, Err(RecorderError::Sync(_))));
        assert_eq!(recorder.state(), RecorderState::Idle);

        let pending = recorder.pending_recovery().await.unwrap().unwrap();
        assert_eq!(pending.phase, SessionPhase::AwaitingSync);
        assert_eq!(pending.session.travel_distance_km, Some(1.0));
        assert_eq!(pending.session.stop_time, Some(at(60)));

        fixture.sync.offline.store(false, Ordering::SeqCst);
        let stored = recorder.retry_sync().await.unwrap();
        assert_eq!(stored.id, Some(7));
        assert_eq!(stored.gps_points(), pending.session.gps_points());
        assert_eq!(recorder.pending_recovery().await.unwrap(), None);

        assert!(matches!(recorder.retry_sync().await, Err(RecorderError::Precondition(_))));
    }

    #[tokio::test]
    async fn unsynced_trip_is_offered_at_next_start() {
        let fixture = Fixture::new();
        fixture.sync.offline.store(true, Ordering::SeqCst);
        let mut recorder = fixture.recorder();

        recorder.start(RecoveryChoice::Resume).await.unwrap();
        fixture.sample(&mut recorder, 48.0, 2.0, 10).await;
        assert!(recorder.stop().await.is_err());

        fixture.clock.set(at(300));
        let status = recorder.start(RecoveryChoice::Resume).await.unwrap();
        assert!(status.recovered);
        assert_eq!(status.points, 1);

        let session = recorder.session().unwrap();
        assert_eq!(session.stop_time, None);
        assert_eq!(session.start_time, Some(at(0)));
    }

    #[tokio::test]
    async fn discarding_starts_fresh() {
        let fixture = Fixture::new();
        let mut recorder = fixture.recorder();
        recorder.start(RecoveryChoice::Resume).await.unwrap();
        fixture.sample(&mut recorder, 48.0, 2.0, 10).await;
        recorder.suspend().await;

        fixture.clock.set(at(300));
        let status = recorder.start(RecoveryChoice::Discard).await.unwrap();
        assert!(!status.recovered);
        assert_eq!(status.points, 0);
        assert_eq!(status.start_time, Some(at(300)));

        recorder.suspend().await;
        assert!(recorder.discard_pending().await.unwrap());
        assert!(!recorder.discard_pending().await.unwrap());
        assert_eq!(fixture.store.get(RECOVERY_KEY).await.unwrap(), None);
    }

    #[tokio::test]
    async fn unreadable_record_must_be_discarded() {
        let fixture = Fixture::new();
        fixture.store.set(RECOVERY_KEY, r#"{"gps_points":"nope"}"#).await.unwrap();
        let mut recorder = fixture.recorder();

        assert!(matches!(
            recorder.start(RecoveryChoice::Resume).await,
            Err(RecorderError::Validation(_))
        ));
        assert!(recorder.discard_pending().await.unwrap());
        recorder.start(RecoveryChoice::Resume).await.unwrap();
    }

    #[tokio::test]
    async fn record_without_start_or_points_cannot_resume() {
        let fixture = Fixture::new();
        fixture.store.set(RECOVERY_KEY, r#"{"gps_points":[]}"#).await.unwrap();
        let mut recorder = fixture.recorder();

        assert!(matches!(
            recorder.start(RecoveryChoice::Resume).await,
            Err(RecorderError::Validation(_))
        ));
        assert!(!fixture.source.is_subscribed().await);
    }

    #[tokio::test]
    async fn samples_after_stop_are_discarded() {
        let fixture = Fixture::new();
        let mut recorder = fixture.recorder();
        recorder.start(RecoveryChoice::Resume).await.unwrap();
        let stored = recorder.stop().await.unwrap();

        assert!(!fixture.source.push_sample(PositionSample::new(48.0, 2.0, at(2))).await);
        let late = PositionEvent::Sample(PositionSample::new(48.0, 2.0, at(2)));
        assert_eq!(recorder.handle_position_event(late).await, Ok(()));
        assert_eq!(recorder.last_trip().await.unwrap(), Some(stored));
        assert_eq!(recorder.stop().await, Err(RecorderError::NotRecording));
    }

    #[tokio::test]
    async fn rejecting_policy_holds_back_short_trips() {
        let mut fixture = Fixture::new();
        fixture.config.distance.floor = DistanceFloor::Reject;
        let mut recorder = fixture.recorder();

        recorder.start(RecoveryChoice::Resume).await.unwrap();
        fixture.sample(&mut recorder, 48.0, 2.0, 0).await;
        fixture.sample(&mut recorder, 48.001, 2.0, 30).await;

        assert!(matches!(recorder.stop().await, Err(RecorderError::Validation(_))));
        assert!(fixture.sync.submitted.lock().unwrap().is_empty());
        let pending = recorder.pending_recovery().await.unwrap().unwrap();
        assert_eq!(pending.phase, SessionPhase::AwaitingSync);
    }

    #[tokio::test]
    async fn coerced_short_trip_reports_minimum() {
        let fixture = Fixture::new();
        let mut recorder = fixture.recorder();

        recorder.start(RecoveryChoice::Resume).await.unwrap();
        fixture.sample(&mut recorder, 48.0, 2.0, 0).await;
        fixture.sample(&mut recorder, 48.001, 2.0, 30).await;

        assert_eq!(recorder.stop().await.unwrap().travel_distance_km, Some(1.0));
    }

    #[tokio::test]
    async fn status_counts_from_start() {
        let fixture = Fixture::new();
        let mut recorder = fixture.recorder();
        assert_eq!(recorder.status(at(0)).state, RecorderState::Idle);

        recorder.start(RecoveryChoice::Resume).await.unwrap();
        fixture.sample(&mut recorder, lat_after_km(0.0), 5.0, 0).await;
        fixture.sample(&mut recorder, lat_after_km(1.0), 5.0, 60).await;

        let status = recorder.status(at(75));
        assert_eq!(status.elapsed, TimeDelta::seconds(75));
        assert_eq!(status.points, 2);
        assert!((status.distance_km - 1.0).abs() < 1e-3);
        assert!(!status.recovered);
    }
}
