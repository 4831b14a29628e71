//! Unified error handling for the sync crate.
//!
//! Errors raised inside the sync coordinator are absorbed into progress and
//! the last sync outcome; only validation failures at the engine boundary
//! and FFI setup failures are returned to callers.

use thiserror::Error;

/// Unified error type for sync, cache and engine operations.
#[derive(Debug, Error, uniffi::Error)]
#[uniffi(flat_error)]
pub enum SyncError {
    /// SQLite operation failed
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Schema migration failed
    #[error("Migration error: {0}")]
    Migration(#[from] rusqlite_migration::Error),

    /// HTTP/API error
    #[error("HTTP error{}: {message}", .status_code.map(|c| format!(" ({})", c)).unwrap_or_default())]
    Http {
        message: String,
        status_code: Option<u16>,
    },

    /// A remote call did not resolve within its window
    #[error("Timed out after {seconds}s: {operation}")]
    Timeout { operation: String, seconds: u64 },

    /// The persistent engine has not been initialized yet
    #[error("Engine not initialized")]
    EngineNotInitialized,

    /// The engine rejected or failed a write
    #[error("Engine write failed: {message}")]
    EngineWrite { message: String },

    /// Caller supplied malformed input
    #[error("Invalid {field}: {message}")]
    InvalidInput { field: String, message: String },

    /// JSON (de)serialization failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Async runtime or thread setup failed
    #[error("Runtime error: {message}")]
    Runtime { message: String },
}

impl SyncError {
    /// Shorthand for a validation failure on a named field.
    pub fn invalid(field: &str, message: impl Into<String>) -> Self {
        SyncError::InvalidInput {
            field: field.to_string(),
            message: message.into(),
        }
    }

    /// Whether this error is a caller-input problem rather than an I/O one.
    pub fn is_validation(&self) -> bool {
        matches!(self, SyncError::InvalidInput { .. })
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        SyncError::Http {
            status_code: e.status().map(|s| s.as_u16()),
            message: e.to_string(),
        }
    }
}

/// Result type alias for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;
