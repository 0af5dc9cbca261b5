//! Error types and handling for gridflux
//!
//! This module defines the error types used throughout the application,
//! providing consistent error handling and reporting.

use thiserror::Error;

/// Result type alias for gridflux operations
pub type Result<T> = std::result::Result<T, GridfluxError>;

/// Main error type for gridflux
#[derive(Debug, Error)]
pub enum GridfluxError {
    /// Configuration-related errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Device transport communication errors
    #[error("Transport error: {message}")]
    Transport { message: String },

    /// Time-series sink errors
    #[error("Sink error: {message}")]
    Sink { message: String },

    /// External API errors (market prices, holidays)
    #[error("API error: {message}")]
    Api { message: String },

    /// Serialization/deserialization errors
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    /// File I/O errors
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Validation errors
    #[error("Validation error: {field} - {message}")]
    Validation { field: String, message: String },

    /// Timeout errors
    #[error("Timeout error: {message}")]
    Timeout { message: String },

    /// Generic errors with context
    #[error("Error: {message}")]
    Generic { message: String },
}

impl GridfluxError {
    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        GridfluxError::Config {
            message: message.into(),
        }
    }

    /// Create a new transport error
    pub fn transport<S: Into<String>>(message: S) -> Self {
        GridfluxError::Transport {
            message: message.into(),
        }
    }

    /// Create a new sink error
    pub fn sink<S: Into<String>>(message: S) -> Self {
        GridfluxError::Sink {
            message: message.into(),
        }
    }

    /// Create a new API error
    pub fn api<S: Into<String>>(message: S) -> Self {
        GridfluxError::Api {
            message: message.into(),
        }
    }

    /// Create a new I/O error
    pub fn io<S: Into<String>>(message: S) -> Self {
        GridfluxError::Io {
            message: message.into(),
        }
    }

    /// Create a new validation error
    pub fn validation<S: Into<String>>(field: S, message: S) -> Self {
        GridfluxError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a new timeout error
    pub fn timeout<S: Into<String>>(message: S) -> Self {
        GridfluxError::Timeout {
            message: message.into(),
        }
    }

    /// Create a new generic error
    pub fn generic<S: Into<String>>(message: S) -> Self {
        GridfluxError::Generic {
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for GridfluxError {
    fn from(err: std::io::Error) -> Self {
        GridfluxError::io(err.to_string())
    }
}

impl From<serde_yaml::Error> for GridfluxError {
    fn from(err: serde_yaml::Error) -> Self {
        GridfluxError::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for GridfluxError {
    fn from(err: serde_json::Error) -> Self {
        GridfluxError::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<reqwest::Error> for GridfluxError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            GridfluxError::timeout(err.to_string())
        } else {
            GridfluxError::api(err.to_string())
        }
    }
}

impl From<chrono::ParseError> for GridfluxError {
    fn from(err: chrono::ParseError) -> Self {
        GridfluxError::validation("datetime", &err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = GridfluxError::config("test config error");
        assert!(matches!(err, GridfluxError::Config { .. }));

        let err = GridfluxError::transport("test transport error");
        assert!(matches!(err, GridfluxError::Transport { .. }));

        let err = GridfluxError::validation("field", "test validation error");
        assert!(matches!(err, GridfluxError::Validation { .. }));
    }

    #[test]
    fn test_error_display() {
        let err = GridfluxError::config("test error");
        let error_string = format!("{}", err);
        assert_eq!(error_string, "Configuration error: test error");

        let err = GridfluxError::validation("test_field", "invalid value");
        let error_string = format!("{}", err);
        assert_eq!(error_string, "Validation error: test_field - invalid value");
    }
}
