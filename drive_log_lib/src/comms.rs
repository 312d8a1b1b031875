//! The JSON contract between the recorder and the backend.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub const SAVE_SESSION_PATH: &str = "/api/session/save";
pub const GET_SESSION_PATH: &str = "/api/session/get";
pub const DELETE_SESSION_PATH: &str = "/api/session/delete";
pub const ALL_SESSIONS_PATH: &str = "/api/session/all";
pub const TOTAL_DISTANCE_PATH: &str = "/api/session/distance";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiStatus {
    Success,
    Error,
}

/// Envelope every backend answer is wrapped in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub status: ApiStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    /// Per-field validation failures, keyed by field name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub errors: BTreeMap<String, String>,
}

impl<T> ApiResponse<T> {
    pub fn success(message: impl Into<String>, data: Option<T>) -> Self {
        Self {
            status: ApiStatus::Success,
            message: Some(message.into()),
            data,
            errors: BTreeMap::new(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: ApiStatus::Error,
            message: Some(message.into()),
            data: None,
            errors: BTreeMap::new(),
        }
    }

    pub fn with_errors(mut self, errors: BTreeMap<String, String>) -> Self {
        self.errors = errors;
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == ApiStatus::Success
    }

    /// The server message, with field errors appended when there are any.
    pub fn describe(&self) -> String {
        let mut text = self.message.clone().unwrap_or_else(|| "No message from server".to_string());
        if !self.errors.is_empty() {
            let details = self
                .errors
                .iter()
                .map(|(field, reason)| format!("{field}: {reason}"))
                .collect::<Vec<_>>()
                .join("; ");
            text.push_str(&format!(" ({details})"));
        }
        text
    }
}
