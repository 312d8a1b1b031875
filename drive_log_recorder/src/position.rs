use std::{
    fmt,
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use drive_log_lib::gps_point::GpsPoint;
use tokio::{
    sync::{Mutex, mpsc, watch},
    task::JoinHandle,
};

use crate::{RecorderError, clock::Clock, gpx_util};

const FEED_CAPACITY: usize = 64;

/// Coarsest fix accepted while high accuracy is requested.
pub const HIGH_ACCURACY_LIMIT_M: f64 = 100.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PositionOptions {
    /// Refuse fixes whose reported accuracy is worse than
    /// `HIGH_ACCURACY_LIMIT_M`. Fixes without an accuracy always pass.
    pub high_accuracy: bool,
    /// Oldest sample still accepted as a current position.
    pub maximum_age: Duration,
    /// How long to wait for each sample before reporting a timeout.
    pub timeout: Duration,
}

impl Default for PositionOptions {
    fn default() -> Self {
        Self {
            high_accuracy: true,
            maximum_age: Duration::from_secs(10),
            timeout: Duration::from_secs(15),
        }
    }
}

impl PositionOptions {
    pub fn accepts(&self, sample: &PositionSample) -> bool {
        !self.high_accuracy || sample.accuracy_m.is_none_or(|accuracy| accuracy <= HIGH_ACCURACY_LIMIT_M)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PositionSample {
    pub lat: f64,
    pub lng: f64,
    pub accuracy_m: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

impl PositionSample {
    pub fn new(lat: f64, lng: f64, timestamp: DateTime<Utc>) -> Self {
        Self {
            lat,
            lng,
            accuracy_m: None,
            timestamp,
        }
    }

    /// Accuracy radius in metres, as reported by the device.
    pub fn with_accuracy(mut self, accuracy_m: f64) -> Self {
        self.accuracy_m = Some(accuracy_m);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PositionError {
    PermissionDenied,
    Timeout,
    Unavailable(String),
}

impl fmt::Display for PositionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PermissionDenied => write!(f, "Permission to read the position was denied"),
            Self::Timeout => write!(f, "No position sample arrived in time"),
            Self::Unavailable(message) => write!(f, "Position feed unavailable: {message}"),
        }
    }
}

impl std::error::Error for PositionError {}

#[derive(Debug, Clone, PartialEq)]
pub enum PositionEvent {
    Sample(PositionSample),
    Error(PositionError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// A live subscription. Events stop once the subscription is cancelled.
#[derive(Debug)]
pub struct PositionFeed {
    pub id: SubscriptionId,
    pub events: mpsc::Receiver<PositionEvent>,
}

impl PositionFeed {
    /// `None` once the source has dropped the subscription.
    pub async fn next(&mut self) -> Option<PositionEvent> {
        self.events.recv().await
    }
}

#[async_trait]
pub trait PositionSource: Send + Sync {
    /// Whether the feed can only be activated over a secure transport.
    fn requires_secure_context(&self) -> bool {
        true
    }

    /// Starts a feed. Only one subscription may be active at a time.
    async fn subscribe(&self, options: &PositionOptions) -> Result<PositionFeed, PositionError>;

    async fn unsubscribe(&self, id: SubscriptionId);

    /// A single fix, outside any subscription.
    async fn current_sample(&self, options: &PositionOptions) -> Result<PositionSample, PositionError>;
}

#[derive(Default)]
struct ChannelState {
    next_id: u64,
    active: Option<(SubscriptionId, mpsc::Sender<PositionEvent>)>,
    denied: bool,
    last_sample: Option<PositionSample>,
}

/// A source fed by whoever holds a clone of it: a host application that owns
/// the platform feed, stdin, or a test.
#[derive(Clone)]
pub struct ChannelPositionSource {
    state: Arc<Mutex<ChannelState>>,
    secure_context: bool,
}

impl Default for ChannelPositionSource {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelPositionSource {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ChannelState::default())),
            secure_context: true,
        }
    }

    pub fn without_secure_context(mut self) -> Self {
        self.secure_context = false;
        self
    }

    /// Makes further subscriptions fail as if the user refused access.
    pub async fn deny_permission(&self) {
        self.state.lock().await.denied = true;
    }

    pub async fn is_subscribed(&self) -> bool {
        self.state.lock().await.active.is_some()
    }

    /// Delivers a sample to the active subscription. Returns false when
    /// nobody is listening.
    pub async fn push_sample(&self, sample: PositionSample) -> bool {
        let sender = {
            let mut state = self.state.lock().await;
            state.last_sample = Some(sample);
            state.active.as_ref().map(|(_, sender)| sender.clone())
        };

        match sender {
            Some(sender) => sender.send(PositionEvent::Sample(sample)).await.is_ok(),
            None => false,
        }
    }

    pub async fn push_error(&self, error: PositionError) -> bool {
        let sender = self.state.lock().await.active.as_ref().map(|(_, sender)| sender.clone());

        match sender {
            Some(sender) => sender.send(PositionEvent::Error(error)).await.is_ok(),
            None => false,
        }
    }

    /// Ends the active feed from the source side.
    pub async fn close(&self) {
        self.state.lock().await.active = None;
    }
}

#[async_trait]
impl PositionSource for ChannelPositionSource {
    fn requires_secure_context(&self) -> bool {
        self.secure_context
    }

    async fn subscribe(&self, _options: &PositionOptions) -> Result<PositionFeed, PositionError> {
        let mut state = self.state.lock().await;

        if state.denied {
            return Err(PositionError::PermissionDenied);
        }
        if state.active.is_some() {
            return Err(PositionError::Unavailable("a subscription is already active".into()));
        }

        state.next_id += 1;
        let id = SubscriptionId(state.next_id);
        let (sender, events) = mpsc::channel(FEED_CAPACITY);
        state.active = Some((id, sender));

        Ok(PositionFeed { id, events })
    }

    async fn unsubscribe(&self, id: SubscriptionId) {
        let mut state = self.state.lock().await;
        if state.active.as_ref().is_some_and(|(active, _)| *active == id) {
            state.active = None;
        }
    }

    async fn current_sample(&self, _options: &PositionOptions) -> Result<PositionSample, PositionError> {
        let state = self.state.lock().await;
        if state.denied {
            return Err(PositionError::PermissionDenied);
        }
        state.last_sample.ok_or(PositionError::Timeout)
    }
}

/// Plays a recorded track back as a live feed.
///
/// Gaps between points are divided by `speed`. Samples are stamped with the
/// clock at the moment they are emitted, and a timeout is reported for every
/// `timeout` that passes without a point.
pub struct GpxReplaySource {
    points: Arc<Vec<GpsPoint>>,
    speed: f64,
    clock: Arc<dyn Clock>,
    next_id: AtomicU64,
    active: Mutex<Option<(SubscriptionId, JoinHandle<()>)>>,
    finished: Arc<watch::Sender<bool>>,
}

impl GpxReplaySource {
    pub fn new(points: Vec<GpsPoint>, speed: f64, clock: Arc<dyn Clock>) -> Self {
        Self {
            points: Arc::new(points),
            speed: if speed > 0.0 { speed } else { 1.0 },
            clock,
            next_id: AtomicU64::new(0),
            active: Mutex::new(None),
            finished: Arc::new(watch::channel(false).0),
        }
    }

    pub fn from_file(path: &Path, speed: f64, clock: Arc<dyn Clock>) -> Result<Self, RecorderError> {
        Ok(Self::new(gpx_util::read_track(path)?, speed, clock))
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Resolves once the last point of the current replay has been emitted.
    pub async fn wait_finished(&self) {
        let mut finished = self.finished.subscribe();
        let _ = finished.wait_for(|done| *done).await;
    }
}

#[async_trait]
impl PositionSource for GpxReplaySource {
    fn requires_secure_context(&self) -> bool {
        false
    }

    async fn subscribe(&self, options: &PositionOptions) -> Result<PositionFeed, PositionError> {
        let mut active = self.active.lock().await;
        if active.as_ref().is_some_and(|(_, task)| !task.is_finished()) {
            return Err(PositionError::Unavailable("the replay is already running".into()));
        }
        if self.points.is_empty() {
            return Err(PositionError::Unavailable("the track has no points".into()));
        }

        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let (sender, events) = mpsc::channel(FEED_CAPACITY);
        self.finished.send_replace(false);

        let task = tokio::spawn(replay(
            self.points.clone(),
            self.speed,
            options.timeout,
            self.clock.clone(),
            sender,
            self.finished.clone(),
        ));
        *active = Some((id, task));

        tracing::info!("Replaying {} track points at {}x", self.points.len(), self.speed);
        Ok(PositionFeed { id, events })
    }

    async fn unsubscribe(&self, id: SubscriptionId) {
        let mut active = self.active.lock().await;
        if active.as_ref().is_some_and(|(active_id, _)| *active_id == id) {
            if let Some((_, task)) = active.take() {
                task.abort();
            }
        }
    }

    async fn current_sample(&self, _options: &PositionOptions) -> Result<PositionSample, PositionError> {
        let first = self
            .points
            .first()
            .ok_or_else(|| PositionError::Unavailable("the track has no points".into()))?;

        Ok(PositionSample::new(first.lat(), first.lng(), self.clock.now()))
    }
}

async fn replay(
    points: Arc<Vec<GpsPoint>>,
    speed: f64,
    timeout: Duration,
    clock: Arc<dyn Clock>,
    sender: mpsc::Sender<PositionEvent>,
    finished: Arc<watch::Sender<bool>>,
) {
    let mut previous: Option<DateTime<Utc>> = None;

    for point in points.iter() {
        if let Some(previous) = previous {
            let gap = (point.recorded_at() - previous).to_std().unwrap_or_default();
            let mut remaining = gap.div_f64(speed);

            while remaining > timeout {
                tokio::time::sleep(timeout).await;
                remaining -= timeout;
                if sender.send(PositionEvent::Error(PositionError::Timeout)).await.is_err() {
                    return;
                }
            }
            tokio::time::sleep(remaining).await;
        }
        previous = Some(point.recorded_at());

        let sample = PositionSample::new(point.lat(), point.lng(), clock.now());
        if sender.send(PositionEvent::Sample(sample)).await.is_err() {
            return;
        }
    }

    tracing::debug!("Replay reached the end of the track");
    finished.send_replace(true);

    // The feed stays open, like a device that has stopped moving.
    sender.closed().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::{TimeDelta, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn channel_source_delivers_to_active_subscription() {
        let source = ChannelPositionSource::new();
        let sample = PositionSample::new(48.0, 2.0, t0());
        assert!(!source.push_sample(sample).await);

        let mut feed = source.subscribe(&PositionOptions::default()).await.unwrap();
        assert!(source.subscribe(&PositionOptions::default()).await.is_err());

        assert!(source.push_sample(sample).await);
        assert_eq!(feed.next().await, Some(PositionEvent::Sample(sample)));
        assert_eq!(source.current_sample(&PositionOptions::default()).await, Ok(sample));

        source.unsubscribe(feed.id).await;
        assert!(!source.is_subscribed().await);
        assert_eq!(feed.next().await, None);
    }

    #[test]
    fn high_accuracy_refuses_coarse_fixes() {
        let precise = PositionSample::new(48.0, 2.0, t0()).with_accuracy(12.0);
        let coarse = PositionSample::new(48.0, 2.0, t0()).with_accuracy(850.0);
        let unknown = PositionSample::new(48.0, 2.0, t0());

        let options = PositionOptions::default();
        assert!(options.accepts(&precise));
        assert!(!options.accepts(&coarse));
        assert!(options.accepts(&unknown));

        let relaxed = PositionOptions {
            high_accuracy: false,
            ..Default::default()
        };
        assert!(relaxed.accepts(&coarse));
    }

    #[tokio::test]
    async fn denied_source_refuses_subscription() {
        let source = ChannelPositionSource::new();
        source.deny_permission().await;

        let result = source.subscribe(&PositionOptions::default()).await;
        assert_eq!(result.err(), Some(PositionError::PermissionDenied));
    }

    #[tokio::test(start_paused = true)]
    async fn replay_emits_points_and_timeouts() {
        let clock = ManualClock::new(t0());
        let points = vec![
            GpsPoint::new(48.0, 2.0, t0()).unwrap(),
            GpsPoint::new(48.1, 2.0, t0() + TimeDelta::seconds(40)).unwrap(),
        ];
        let source = GpxReplaySource::new(points, 1.0, Arc::new(clock));
        let options = PositionOptions {
            timeout: Duration::from_secs(15),
            ..Default::default()
        };

        let mut feed = source.subscribe(&options).await.unwrap();
        assert!(source.subscribe(&options).await.is_err());

        assert!(matches!(feed.next().await, Some(PositionEvent::Sample(s)) if s.lat == 48.0));
        assert_eq!(feed.next().await, Some(PositionEvent::Error(PositionError::Timeout)));
        assert_eq!(feed.next().await, Some(PositionEvent::Error(PositionError::Timeout)));
        assert!(matches!(feed.next().await, Some(PositionEvent::Sample(s)) if s.lat == 48.1));

        source.wait_finished().await;
        source.unsubscribe(feed.id).await;
        assert_eq!(feed.next().await, None);
    }
}
