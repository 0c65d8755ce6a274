//! Error types for the prefsync system
//!
//! This module defines all error types used throughout the crate.

use thiserror::Error;

/// Result type alias for prefsync operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for the prefsync system
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration errors (missing credential, list id, secret)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Mailing-list service errors, carrying the HTTP status when one was received
    #[error("Service error ({provider}, status {}): {message}", display_status(.status))]
    Service {
        /// Client name
        provider: String,
        /// HTTP status code, `None` for transport failures
        status: Option<u16>,
        /// Error message
        message: String,
    },

    /// Preference store errors
    #[error("Preference store error: {0}")]
    Store(String),

    /// Record not found
    #[error("Record not found: {0}")]
    NotFound(String),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

fn display_status(status: &Option<u16>) -> String {
    status.map_or_else(|| "none".to_string(), |code| code.to_string())
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a service error with an HTTP status
    pub fn service(provider: impl Into<String>, status: u16, message: impl Into<String>) -> Self {
        Self::Service {
            provider: provider.into(),
            status: Some(status),
            message: message.into(),
        }
    }

    /// Create a service error for a failure that produced no HTTP status
    pub fn transport(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Service {
            provider: provider.into(),
            status: None,
            message: message.into(),
        }
    }

    /// Create a preference store error
    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    /// Create a "not found" error
    ///
    /// Stores may return this from `delete`; the engine treats it as an
    /// already-deleted record.
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// HTTP status code attached to this error, if any
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Service { status, .. } => *status,
            _ => None,
        }
    }

    /// Whether the failure is transient and eligible for backoff retry
    ///
    /// Only rate limiting (429) and server errors (5xx) qualify. Anything
    /// without a status, including transport and store failures, is fatal.
    pub fn is_retryable(&self) -> bool {
        matches!(self.status(), Some(429) | Some(500..=599))
    }
}
