//! Error types for kitemux core library.

use thiserror::Error;

/// Result type alias using kitemux Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for kitemux operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Every kite slot is occupied.
    #[error("No more kite slots (capacity {0})")]
    NoMoreKites(usize),

    /// Every frontend slot is occupied.
    #[error("No more frontend slots (capacity {0})")]
    NoMoreFrontends(usize),

    /// Invalid kite specification
    #[error("Invalid kite: {0}")]
    InvalidKite(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
