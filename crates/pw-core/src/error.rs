//! Error types for the patchwork core library.

use thiserror::Error;

/// Core error types for patchwork operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid role: {0}")]
    InvalidRole(String),

    #[error("Invalid provisional status: {0}")]
    InvalidStatus(String),

    #[error("Invalid identity kind: {0}")]
    InvalidKind(String),

    #[error("Invalid trigger mode: {0}")]
    InvalidTriggerMode(String),

    #[error("Invalid job status: {0}")]
    InvalidJobStatus(String),

    #[error("Schema validation error: {0}")]
    SchemaValidation(String),

    #[error("Config error: {0}")]
    Config(String),
}

/// Result type alias using the patchwork core Error type.
pub type Result<T> = std::result::Result<T, Error>;
