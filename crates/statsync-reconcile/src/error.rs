//! Error types for the reconciler.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while resolving or reconciling.
#[derive(Error, Debug)]
pub enum Error {
    /// A referenced record, or a field expected on it, is absent upstream.
    #[error("{what} not found: {id}")]
    NotFound {
        /// What was looked up, e.g. `gateway` or `device owner`.
        what: String,
        /// Identifier of the record that was looked up.
        id: String,
    },

    /// Redis error.
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Postgres error.
    #[error("Postgres error: {0}")]
    Postgres(#[from] sqlx::Error),

    /// More than one relational row mirrors the same external sensor id.
    #[error("ambiguous state: {rows} rows stored for sensor {sensor_id}")]
    AmbiguousState {
        /// External sensor identifier.
        sensor_id: String,
        /// Number of rows found.
        rows: usize,
    },

    /// An identifier that would be spliced into SQL failed validation.
    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),

    /// Stored data could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),
}

impl Error {
    /// Shorthand for [`Error::NotFound`].
    pub fn not_found(what: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            what: what.into(),
            id: id.into(),
        }
    }

    /// Whether this is a transport/query failure against either store.
    pub fn is_store_error(&self) -> bool {
        matches!(self, Self::Redis(_) | Self::Postgres(_))
    }

    /// Whether this is a missing upstream record or field.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}
