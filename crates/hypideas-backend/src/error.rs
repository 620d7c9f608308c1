use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;

use hypideas_types::{RowError, ValidationError};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("not signed in or session expired: {0}")]
    Unauthorized(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("backend error {status} ({code}): {message}")]
    Backend {
        status: u16,
        code: String,
        message: String,
    },

    #[error("could not decode response: {0}")]
    Decode(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl Error {
    /// Text suitable for showing to the person using the app.
    pub fn user_message(&self) -> String {
        match self {
            Error::Validation(e) => e.to_string(),
            Error::Unauthorized(_) => "Your session has expired. Please sign in again.".into(),
            Error::NotFound(_) => "That item no longer exists.".into(),
            Error::Conflict(_) => "That already exists.".into(),
            _ => "Something went wrong. Please try again.".into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Decode(e.to_string())
    }
}

impl From<RowError> for Error {
    fn from(e: RowError) -> Self {
        Error::Decode(e.to_string())
    }
}

/// Error body returned by the REST and auth endpoints.
#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: Option<serde_json::Value>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
    #[serde(default)]
    details: Option<String>,
}

/// Map a failed HTTP response onto the error taxonomy.
pub fn from_response(status: StatusCode, body: &str) -> Error {
    let parsed: ErrorBody = serde_json::from_str(body).unwrap_or_default();
    let code = match parsed.code {
        Some(serde_json::Value::String(s)) => s,
        Some(other) => other.to_string(),
        None => String::new(),
    };
    let message = parsed
        .message
        .or(parsed.msg)
        .or(parsed.error_description)
        .or(parsed.details)
        .unwrap_or_else(|| body.trim().to_string());

    if status == StatusCode::UNAUTHORIZED || message.contains("JWT expired") {
        return Error::Unauthorized(message);
    }
    if code == "PGRST116" || status == StatusCode::NOT_FOUND {
        return Error::NotFound(message);
    }
    if code == "23505" || status == StatusCode::CONFLICT {
        return Error::Conflict(message);
    }
    Error::Backend {
        status: status.as_u16(),
        code,
        message,
    }
}
