/*!
Error types for the Rewind core.
*/

use rewind_retry::{RetryError, RetryableError};
use thiserror::Error;

/// Result type used throughout the Rewind core.
pub type Result<T> = std::result::Result<T, StateError>;

/// Errors raised by persistence, restoration, and configuration.
///
/// In-memory state transitions never fail; these errors only surface from
/// the durable store, the construction-time load, and setup code.
#[derive(Error, Debug)]
pub enum StateError {
    /// I/O errors during file operations
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Compression/decompression errors
    #[error("Compression error: {0}")]
    Compression(String),

    /// Key-value store errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// Configuration errors
    #[error("Validation error: {0}")]
    Validation(String),

    /// The upgrade function failed while migrating persisted state
    #[error("Migration error: {0}")]
    Migration(String),

    /// The construction-time load did not complete
    #[error("Load error: {0}")]
    Load(String),

    /// A retried write ran out of attempts or failed permanently
    #[error(transparent)]
    Retry(#[from] RetryError),
}

impl StateError {
    /// Create a new compression error
    pub fn compression<S: Into<String>>(msg: S) -> Self {
        Self::Compression(msg.into())
    }

    /// Create a new storage error
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a new validation error
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a new migration error
    pub fn migration<S: Into<String>>(msg: S) -> Self {
        Self::Migration(msg.into())
    }

    /// Create a new load error
    pub fn load<S: Into<String>>(msg: S) -> Self {
        Self::Load(msg.into())
    }
}

impl RetryableError for StateError {
    fn is_transient(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Storage(_))
    }
}
