//! Error types for the tracker core
//!
//! All errors use thiserror for structured error handling.
//! These errors can be serialized into the UI error slot.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Network error: {0}")]
    Network(String),

    #[error("HTTP {status}: {message}")]
    Api { status: u16, message: String },

    #[error("{0}")]
    Config(String),

    #[error("Cannot {action}: invalid state {state}")]
    InvalidState { action: String, state: String },

    #[error("Cannot end shift: Ride in progress")]
    RideInProgress,

    #[error("No rides found")]
    NoRideFound,

    #[error("No active shift")]
    NoActiveShift,

    #[error("Shift not found: {0}")]
    ShiftNotFound(String),

    #[error("Ride not found: {0}")]
    RideNotFound(String),

    #[error("Expense not found: {0}")]
    ExpenseNotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("{0}")]
    Generic(String),
}

impl AppError {
    /// Definitive rejection by the server (HTTP 4xx). Retrying will not help.
    pub fn is_client_error(&self) -> bool {
        matches!(self, AppError::Api { status, .. } if (400..500).contains(status))
    }

    /// Whether the API client may retry the request that produced this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::Api { status, .. } => !(400..500).contains(status),
            AppError::Http(_) | AppError::Network(_) => true,
            _ => false,
        }
    }
}

impl serde::Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_errors_are_not_retryable() {
        let err = AppError::Api {
            status: 401,
            message: "unauthorized".to_string(),
        };
        assert!(err.is_client_error());
        assert!(!err.is_retryable());
        assert_eq!(err.to_string(), "HTTP 401: unauthorized");
    }

    #[test]
    fn test_server_and_network_errors_are_retryable() {
        let err = AppError::Api {
            status: 502,
            message: "bad gateway".to_string(),
        };
        assert!(!err.is_client_error());
        assert!(err.is_retryable());
        assert!(AppError::Network("connection refused".to_string()).is_retryable());
        assert!(!AppError::Config("missing".to_string()).is_retryable());
    }

    #[test]
    fn test_serializes_as_message() {
        let json = serde_json::to_string(&AppError::RideInProgress).unwrap();

        assert_eq!(json, "\"Cannot end shift: Ride in progress\"");
    }
}
