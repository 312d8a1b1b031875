use std::fmt;

use drive_log_lib::SessionError;

pub mod actor;
pub mod clock;
pub mod config;
pub mod gpx_util;
pub mod position;
pub mod recorder;
pub mod store;
pub mod sync;
pub mod wake_lock;

pub use recorder::*;

use sync::SyncError;

/// Storage key of the single recovery record.
pub const RECOVERY_KEY: &str = "currentSession";
pub const CONFIG_FILE_NAME: &str = "drive_log.json";
pub const LOG_DIR: &str = "log";

#[derive(Debug, Clone, PartialEq)]
pub enum RecorderError {
    Precondition(String),
    AlreadyRecording,
    NotRecording,
    PositionUnavailable(String),
    SampleTimeout,
    Persistence(String),
    Sync(SyncError),
    Validation(String),
    Config(String),
}

impl fmt::Display for RecorderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Precondition(message) => write!(f, "Precondition failed: {message}"),
            Self::AlreadyRecording => write!(f, "A trip is already being recorded"),
            Self::NotRecording => write!(f, "No trip is being recorded"),
            Self::PositionUnavailable(message) => write!(f, "Position unavailable: {message}"),
            Self::SampleTimeout => write!(f, "Timed out waiting for a position sample"),
            Self::Persistence(message) => write!(f, "Failed to persist trip: {message}"),
            Self::Sync(err) => write!(f, "Failed to sync trip: {err}"),
            Self::Validation(message) => write!(f, "Invalid trip: {message}"),
            Self::Config(message) => write!(f, "Invalid configuration: {message}"),
        }
    }
}

impl std::error::Error for RecorderError {}

impl From<SyncError> for RecorderError {
    fn from(err: SyncError) -> Self {
        Self::Sync(err)
    }
}

impl From<SessionError> for RecorderError {
    fn from(err: SessionError) -> Self {
        Self::Validation(err.to_string())
    }
}
