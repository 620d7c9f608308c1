pub mod api;
pub mod events;
pub mod models;

use thiserror::Error;

/// Input rejected before it reaches the backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Please enter a {0}")]
    Required(&'static str),

    #[error("The {field} must be at most {max} characters")]
    TooLong { field: &'static str, max: usize },

    #[error("Invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// A backend row that does not have the shape the client expects.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RowError {
    #[error("row has both conversation_id and channel_id")]
    AmbiguousTarget,

    #[error("row has neither conversation_id nor channel_id")]
    MissingTarget,

    #[error("row is missing {0}")]
    MissingField(&'static str),

    #[error("unknown {field} value '{value}'")]
    UnknownVariant { field: &'static str, value: String },

    #[error("malformed row: {0}")]
    Malformed(String),
}
