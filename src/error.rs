//! # Error Types
//!
//! Custom error types for Capture Sync using `thiserror`.

use thiserror::Error;

/// Main error type for Capture Sync
#[derive(Debug, Error)]
pub enum CaptureSyncError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Telemetry socket could not be bound
    #[error("Failed to bind telemetry socket on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// Address in configuration could not be resolved
    #[error("Invalid socket address: {0}")]
    InvalidAddress(String),

    /// Video frame source errors
    #[error("Frame source error: {0}")]
    Source(String),

    /// Streaming sink errors
    #[error("Sink error: {0}")]
    Sink(String),

    /// Signal handler could not be installed
    #[error("Signal handler error: {0}")]
    Signal(std::io::Error),
}

/// Result type alias for Capture Sync
pub type Result<T> = std::result::Result<T, CaptureSyncError>;
