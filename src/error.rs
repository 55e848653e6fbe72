//! # Error Types
//!
//! Custom error types for the station core using `thiserror`.

use thiserror::Error;

/// Main error type for the station core
#[derive(Debug, Error)]
pub enum StationError {
    /// Serial port errors (open, read, write)
    #[error("Serial error: {0}")]
    Serial(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    /// Station identity file missing or malformed
    #[error("Station identity error: {0}")]
    StationId(String),

    /// Object store rejected or did not confirm a transfer
    #[error("Upload error: {0}")]
    Upload(String),

    /// Backend rejected a health checkin
    #[error("Checkin error: {0}")]
    Checkin(String),

    /// HTTP transport errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON encoding/decoding errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// CSV encoding errors
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Operator command that cannot be carried out
    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for the station core
pub type Result<T> = std::result::Result<T, StationError>;
