//! Error type definitions for the stream scheduler

use thiserror::Error;

/// Top-level application error type
///
/// Spawn and runtime failures are produced by the process supervisor; the
/// web layer maps each variant onto an HTTP status (see `web::responses`).
#[derive(Error, Debug)]
pub enum AppError {
    /// Missing or malformed input (title, video, file extension, schedule)
    #[error("Validation error: {message}")]
    Validation { message: String },

    /// The stream key is already scheduled or live
    #[error("Stream key already in use: {stream_key}")]
    Conflict { stream_key: String },

    /// The encoder process could not be started
    #[error("Failed to start encoder: {message}")]
    Spawn { message: String },

    /// The encoder exited abnormally without being asked to stop
    #[error("Encoder exited abnormally: {message}")]
    Runtime { message: String },

    /// Stop/cancel/lookup on an unknown key or record
    #[error("Not found: {resource} {id}")]
    NotFound { resource: String, id: String },

    /// Durable store failures
    #[error("Persistence error: {0}")]
    Persistence(#[from] sqlx::Error),

    /// Filesystem errors (staging uploads, moving files)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Generic internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl AppError {
    /// Create a validation error with a custom message
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Create a conflict error for a stream key
    pub fn conflict<S: Into<String>>(stream_key: S) -> Self {
        Self::Conflict {
            stream_key: stream_key.into(),
        }
    }

    /// Create a spawn error
    pub fn spawn<S: Into<String>>(message: S) -> Self {
        Self::Spawn {
            message: message.into(),
        }
    }

    /// Create a runtime error
    pub fn runtime<S: Into<String>>(message: S) -> Self {
        Self::Runtime {
            message: message.into(),
        }
    }

    /// Create a not found error for a specific resource
    pub fn not_found<R: Into<String>, I: Into<String>>(resource: R, id: I) -> Self {
        Self::NotFound {
            resource: resource.into(),
            id: id.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Short machine-readable name of the error category
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation",
            Self::Conflict { .. } => "conflict",
            Self::Spawn { .. } => "spawn",
            Self::Runtime { .. } => "runtime",
            Self::NotFound { .. } => "not_found",
            Self::Persistence(_) => "persistence",
            Self::Io(_) => "io",
            Self::Configuration { .. } => "configuration",
            Self::Internal { .. } => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(AppError::validation("x").kind(), "validation");
        assert_eq!(AppError::conflict("k1").kind(), "conflict");
        assert_eq!(AppError::not_found("stream", "k1").kind(), "not_found");
        assert_eq!(
            AppError::Persistence(sqlx::Error::RowNotFound).kind(),
            "persistence"
        );
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(
            AppError::conflict("k1").to_string(),
            "Stream key already in use: k1"
        );
        assert_eq!(
            AppError::not_found("stream", "k9").to_string(),
            "Not found: stream k9"
        );
    }
}
