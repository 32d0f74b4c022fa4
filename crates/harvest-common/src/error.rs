//! Error types for the harvest pipeline
//!
//! Transient classes (`Transport`, `RateLimited`, `Server`) are absorbed by the
//! retrying client and only surface wrapped in `RetriesExceeded` or on the
//! final transport attempt. `SchemaOrConstraint` is absorbed by the batch
//! writer, which bisects until the offending record is isolated.

use thiserror::Error;

use crate::types::PayloadError;

/// Result type alias for harvest operations
pub type Result<T> = std::result::Result<T, HarvestError>;

/// Main error type for the harvest pipeline
#[derive(Error, Debug)]
pub enum HarvestError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Rate limited (retry after {retry_after_secs:?}s)")]
    RateLimited { retry_after_secs: Option<f64> },

    #[error("Server error: HTTP {status}")]
    Server { status: u16 },

    #[error("Not found: {message}")]
    NotFound { message: String },

    #[error("Client error: HTTP {status}: {message}")]
    Client { status: u16, message: String },

    #[error("Exceeded maximum retries ({attempts} attempts); last error: {last}")]
    RetriesExceeded {
        attempts: u32,
        #[source]
        last: Box<HarvestError>,
    },

    #[error("Failed to decode response: {0}")]
    Decode(String),

    #[error("Malformed payload: {0}")]
    Payload(#[from] PayloadError),

    #[error("Schema or constraint violation: {0}")]
    SchemaOrConstraint(String),

    #[error("Unrecoverable record {id}: {reason}")]
    UnrecoverableRecord { id: String, reason: String },

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Worker panicked: {0}")]
    Panicked(String),

    #[error("Operation cancelled")]
    Cancelled,
}

impl HarvestError {
    /// Whether the retrying client should try this request again
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::RateLimited { .. } | Self::Server { .. }
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Write-time rejection that the batch writer recovers from by bisection
    pub fn is_schema_or_constraint(&self) -> bool {
        matches!(self, Self::SchemaOrConstraint(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn schema_or_constraint(msg: impl Into<String>) -> Self {
        Self::SchemaOrConstraint(msg.into())
    }
}
