use serde_json::error::Category;
use thiserror::Error;

/// Canonical error type for spill bookkeeping and disk spilling.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Entity was not tracked where it was expected.
    #[error("{entity} `{id}` was not found")]
    NotFound {
        /// Entity type name (e.g. `"proxy"`).
        entity: &'static str,
        /// Identifier of the missing entity.
        id: String,
    },

    /// Entity is already tracked and cannot be added again.
    #[error("{entity} `{id}` already exists")]
    AlreadyExists {
        /// Entity type name (e.g. `"proxy"`).
        entity: &'static str,
        /// Identifier that conflicts.
        id: String,
    },

    /// Bookkeeping does not match what the proxies report about themselves.
    #[error("invalid state: {message}")]
    InvalidState {
        /// Human-readable explanation of the invalid state.
        message: String,
    },

    /// Process-wide configuration was changed after it became immutable.
    #[error("configuration conflict: {message}")]
    ConfigConflict {
        /// Human-readable explanation of the conflict.
        message: String,
    },

    /// I/O error occurred while writing or reading spill files.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization error occurred.
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// Deserialization error occurred.
    #[error("deserialization error: {0}")]
    DeserializationError(String),

    /// Validation error for configuration or input data.
    #[error("validation error: {0}")]
    ValidationError(String),
}

impl CoreError {
    /// Creates a `NotFound` variant.
    #[must_use]
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    /// Creates an `AlreadyExists` variant.
    #[must_use]
    pub fn already_exists(entity: &'static str, id: impl Into<String>) -> Self {
        Self::AlreadyExists {
            entity,
            id: id.into(),
        }
    }

    /// Creates an `InvalidState` variant.
    #[must_use]
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    /// Creates a `ConfigConflict` variant.
    #[must_use]
    pub fn config_conflict(message: impl Into<String>) -> Self {
        Self::ConfigConflict {
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        match err.classify() {
            Category::Syntax | Category::Data | Category::Eof => {
                Self::DeserializationError(err.to_string())
            }
            Category::Io => Self::SerializationError(err.to_string()),
        }
    }
}

impl From<config::ConfigError> for CoreError {
    fn from(err: config::ConfigError) -> Self {
        Self::ValidationError(err.to_string())
    }
}

/// Convenient result alias for spill operations.
pub type CoreResult<T> = Result<T, CoreError>;
