use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use drive_log_lib::distance::round_km;
use serde::{Deserialize, Serialize};

use crate::{CONFIG_FILE_NAME, RecorderError, position::PositionOptions};

pub const SERVER_URL_ENV: &str = "DRIVE_LOG_SERVER_URL";
pub const DATA_DIR_ENV: &str = "DRIVE_LOG_DATA_DIR";

const DEFAULT_SERVER_URL: &str = "http://127.0.0.1:8080";
const DEFAULT_REFRESH_INTERVAL_MS: u64 = 1_000;
const DEFAULT_PROGRESS_TARGET_KM: f64 = 3_000.0;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    pub server_url: String,
    pub data_dir: PathBuf,
    pub transport: TransportMode,
    pub position: PositionConfig,
    pub distance: DistancePolicy,
    pub sync: SyncConfig,
    pub refresh_interval_ms: u64,
    /// Distance the summary gauge counts towards.
    pub progress_target_km: f64,
    pub wake_lock: WakeLockConfig,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            data_dir: default_data_dir(),
            transport: TransportMode::default(),
            position: PositionConfig::default(),
            distance: DistancePolicy::default(),
            sync: SyncConfig::default(),
            refresh_interval_ms: DEFAULT_REFRESH_INTERVAL_MS,
            progress_target_km: DEFAULT_PROGRESS_TARGET_KM,
            wake_lock: WakeLockConfig::default(),
        }
    }
}

impl RecorderConfig {
    /// Reads `drive_log.json` from the data directory when it exists, then
    /// applies environment overrides.
    pub fn load() -> Result<Self, RecorderError> {
        Self::load_with(|name| std::env::var(name).ok())
    }

    pub fn load_with(env: impl Fn(&str) -> Option<String>) -> Result<Self, RecorderError> {
        let data_dir = read_non_empty(&env, DATA_DIR_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(default_data_dir);

        let mut config = match Self::from_file(&data_dir.join(CONFIG_FILE_NAME))? {
            Some(config) => config,
            None => Self {
                data_dir,
                ..Default::default()
            },
        };

        config.apply_env(env);
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Option<Self>, RecorderError> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(RecorderError::Config(format!("Failed to read {path:?}: {err}"))),
        };

        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|err| RecorderError::Config(format!("Failed to parse {path:?}: {err}")))
    }

    pub fn apply_env(&mut self, env: impl Fn(&str) -> Option<String>) {
        if let Some(server_url) = read_non_empty(&env, SERVER_URL_ENV) {
            self.server_url = server_url;
        }

        if let Some(data_dir) = read_non_empty(&env, DATA_DIR_ENV) {
            self.data_dir = PathBuf::from(data_dir);
        }
    }

    pub fn validate(&self) -> Result<(), RecorderError> {
        let url = reqwest::Url::parse(&self.server_url)
            .map_err(|err| RecorderError::Config(format!("server_url {:?}: {err}", self.server_url)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(RecorderError::Config(format!("server_url must be http or https, got {:?}", url.scheme())));
        }

        if self.refresh_interval_ms == 0 {
            return Err(RecorderError::Config("refresh_interval_ms must be positive".into()));
        }

        if !(self.distance.minimum_km >= 0.0) || !(self.distance.round_to_km >= 0.0) {
            return Err(RecorderError::Config("distance settings must not be negative".into()));
        }

        if self.wake_lock.command.as_ref().is_some_and(|argv| argv.is_empty()) {
            return Err(RecorderError::Config("wake_lock.command must name a program".into()));
        }

        Ok(())
    }

    pub fn transport_context(&self) -> TransportContext {
        self.transport.resolve(&self.server_url)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join(crate::LOG_DIR)
    }
}

pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join("drive_log"))
        .unwrap_or_else(|| PathBuf::from("data"))
}

fn read_non_empty(env: &impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    env(name)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    #[default]
    Auto,
    Secure,
    Insecure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportContext {
    Secure,
    Insecure,
}

impl TransportMode {
    /// `Auto` follows the server URL: https is secure, and so is plain http
    /// to the loopback host.
    pub fn resolve(self, server_url: &str) -> TransportContext {
        match self {
            TransportMode::Secure => TransportContext::Secure,
            TransportMode::Insecure => TransportContext::Insecure,
            TransportMode::Auto => {
                let Ok(url) = reqwest::Url::parse(server_url) else {
                    return TransportContext::Insecure;
                };

                let loopback = matches!(url.host_str(), Some("localhost" | "127.0.0.1" | "[::1]"));
                if url.scheme() == "https" || loopback {
                    TransportContext::Secure
                } else {
                    TransportContext::Insecure
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PositionConfig {
    pub high_accuracy: bool,
    pub maximum_age_secs: u64,
    pub timeout_secs: u64,
}

impl Default for PositionConfig {
    fn default() -> Self {
        let options = PositionOptions::default();
        Self {
            high_accuracy: options.high_accuracy,
            maximum_age_secs: options.maximum_age.as_secs(),
            timeout_secs: options.timeout.as_secs(),
        }
    }
}

impl PositionConfig {
    pub fn options(&self) -> PositionOptions {
        PositionOptions {
            high_accuracy: self.high_accuracy,
            maximum_age: Duration::from_secs(self.maximum_age_secs),
            timeout: Duration::from_secs(self.timeout_secs.max(1)),
        }
    }
}

/// What to do with a GPS distance below `minimum_km`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistanceFloor {
    #[default]
    Coerce,
    Reject,
    Off,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DistancePolicy {
    pub minimum_km: f64,
    pub floor: DistanceFloor,
    pub round_to_km: f64,
}

impl Default for DistancePolicy {
    fn default() -> Self {
        Self {
            minimum_km: drive_log_lib::validation::MIN_TRAVEL_DISTANCE_KM,
            floor: DistanceFloor::Coerce,
            round_to_km: 1.0,
        }
    }
}

impl DistancePolicy {
    /// Rounds a GPS distance and applies the minimum.
    pub fn apply(&self, distance_km: f64) -> Result<f64, RecorderError> {
        let rounded = round_km(distance_km, self.round_to_km);

        match self.floor {
            DistanceFloor::Off => Ok(rounded),
            DistanceFloor::Coerce => Ok(rounded.max(self.minimum_km)),
            DistanceFloor::Reject if rounded < self.minimum_km => Err(RecorderError::Validation(format!(
                "travel distance {rounded} km is below the minimum of {} km",
                self.minimum_km
            ))),
            DistanceFloor::Reject => Ok(rounded),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub request_timeout_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
        }
    }
}

impl SyncConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WakeLockConfig {
    /// Program and arguments to keep running while a trip is recorded, e.g.
    /// `["systemd-inhibit", "--what=idle:sleep", "sleep", "infinity"]`.
    pub command: Option<Vec<String>>,
}
