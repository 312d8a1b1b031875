use std::{fmt, time::Duration};

use async_trait::async_trait;
use drive_log_lib::{
    comms::{
        ALL_SESSIONS_PATH, ApiResponse, DELETE_SESSION_PATH, GET_SESSION_PATH, SAVE_SESSION_PATH,
        TOTAL_DISTANCE_PATH,
    },
    trip_session::TripSession,
};
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum SyncError {
    Transport(String),
    Server { status: u16, message: String },
    Decode(String),
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(message) => write!(f, "Could not reach the server: {message}"),
            Self::Server { status, message } => write!(f, "Server refused the request ({status}): {message}"),
            Self::Decode(message) => write!(f, "Unexpected server response: {message}"),
        }
    }
}

impl std::error::Error for SyncError {}

/// The backend as seen by the recorder. Every call is a single exchange,
/// retrying is up to the caller.
#[async_trait]
pub trait SessionSync: Send + Sync {
    /// Stores a closed session and returns the backend's copy of it.
    async fn submit(&self, session: &TripSession) -> Result<TripSession, SyncError>;

    async fn get_session(&self, id: i64) -> Result<TripSession, SyncError>;

    async fn delete_session(&self, id: i64) -> Result<(), SyncError>;

    async fn all_sessions(&self) -> Result<Vec<TripSession>, SyncError>;

    /// Sum of all stored travel distances in kilometres.
    async fn total_distance(&self) -> Result<f64, SyncError>;
}

pub struct HttpSyncClient {
    client: Client,
    base_url: String,
}

impl HttpSyncClient {
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Result<Self, SyncError> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|err| SyncError::Transport(err.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<ApiResponse<T>, SyncError> {
        let response = self
            .client
            .get(self.url(path))
            .send()
            .await
            .map_err(|err| SyncError::Transport(err.to_string()))?;

        read_envelope(response).await
    }
}

/// Unwraps the `{status, message, data}` envelope. A non-2xx status or an
/// error status inside the envelope both become `SyncError::Server`.
async fn read_envelope<T: DeserializeOwned>(response: Response) -> Result<ApiResponse<T>, SyncError> {
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|err| SyncError::Transport(err.to_string()))?;

    match serde_json::from_str::<ApiResponse<T>>(&body) {
        Ok(envelope) if status.is_success() && envelope.is_success() => Ok(envelope),
        Ok(envelope) => Err(SyncError::Server {
            status: status.as_u16(),
            message: envelope.describe(),
        }),
        Err(err) if status.is_success() => Err(SyncError::Decode(err.to_string())),
        Err(_) => Err(SyncError::Server {
            status: status.as_u16(),
            message: status.canonical_reason().unwrap_or("Unknown error").to_string(),
        }),
    }
}

fn require_data<T>(envelope: ApiResponse<T>) -> Result<T, SyncError> {
    envelope
        .data
        .ok_or_else(|| SyncError::Decode("response carried no data".into()))
}

#[async_trait]
impl SessionSync for HttpSyncClient {
    async fn submit(&self, session: &TripSession) -> Result<TripSession, SyncError> {
        debug!("Submitting session with {} points", session.gps_points().len());

        let response = self
            .client
            .post(self.url(SAVE_SESSION_PATH))
            .json(session)
            .send()
            .await
            .map_err(|err| SyncError::Transport(err.to_string()))?;

        let stored = require_data(read_envelope::<TripSession>(response).await?)?;
        info!("Session stored with id {:?}", stored.id);
        Ok(stored)
    }

    async fn get_session(&self, id: i64) -> Result<TripSession, SyncError> {
        require_data(self.get(&format!("{GET_SESSION_PATH}/{id}")).await?)
    }

    async fn delete_session(&self, id: i64) -> Result<(), SyncError> {
        self.get::<serde_json::Value>(&format!("{DELETE_SESSION_PATH}/{id}")).await?;
        info!("Deleted session {id}");
        Ok(())
    }

    async fn all_sessions(&self) -> Result<Vec<TripSession>, SyncError> {
        Ok(self.get::<Vec<TripSession>>(ALL_SESSIONS_PATH).await?.data.unwrap_or_default())
    }

    async fn total_distance(&self) -> Result<f64, SyncError> {
        // Some backends send the sum as a string.
        match require_data(self.get::<serde_json::Value>(TOTAL_DISTANCE_PATH).await?)? {
            serde_json::Value::Number(number) => number
                .as_f64()
                .ok_or_else(|| SyncError::Decode(format!("distance {number} is not a number"))),
            serde_json::Value::String(text) => text.trim().parse().map_err(|_| {
                warn!("Server sent distance {text:?}");
                SyncError::Decode(format!("distance {text:?} is not a number"))
            }),
            serde_json::Value::Null => Ok(0.0),
            other => Err(SyncError::Decode(format!("distance {other} is not a number"))),
        }
    }
}
