//! Error types for the statsync change-feed model.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while decoding change-feed messages.
#[derive(Error, Debug)]
pub enum Error {
    /// A required field is absent from the message.
    #[error("missing field '{0}' in change message")]
    MissingField(&'static str),

    /// The operation letter is not one of `C`, `U`, `D`.
    #[error("unknown operation '{0}'")]
    UnknownOperation(String),

    /// A field is present but has an unusable value.
    #[error("invalid field '{field}': {reason}")]
    InvalidField {
        /// The name of the invalid field.
        field: &'static str,
        /// Description of what's wrong.
        reason: String,
    },

    /// JSON parsing error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
