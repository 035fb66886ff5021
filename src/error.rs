//! # Error Types
//!
//! Custom error types for Geo Uplink using `thiserror`.

use thiserror::Error;

/// Main error type for Geo Uplink
#[derive(Debug, Error)]
pub enum UplinkError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    /// Base URL rejected by the protocol formatter
    #[error("Format error: {0}")]
    Format(#[from] FormatError),

    /// Durable queue could not complete a write, delete or read
    #[error("Persistence failure: {0}")]
    Persistence(#[from] QueueError),

    /// Position sensor could not produce fixes
    #[error("Sensor unavailable: {0}")]
    Sensor(#[from] SensorError),

    /// HTTP client could not be built
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    /// Global log subscriber already installed
    #[error("Logging setup failed: {0}")]
    Logging(#[from] tracing_subscriber::util::TryInitError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while turning a position into an outbound request
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FormatError {
    /// Base URL does not parse at all
    #[error("invalid server URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    /// Base URL parses but has no host (e.g. `mailto:` or `file:` URLs)
    #[error("server URL '{0}' has no host")]
    MissingHost(String),
}

/// Errors from the durable request queue
#[derive(Debug, Error)]
pub enum QueueError {
    /// Underlying SQLite failure
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Storage directory could not be prepared
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Queue lock was poisoned by a panicking writer
    #[error("queue lock poisoned")]
    Poisoned,
}

/// Errors reported by a position sensor
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SensorError {
    /// Location permission was refused
    #[error("location permission denied")]
    PermissionDenied,

    /// Sensor hardware or service is not available
    #[error("location sensor unavailable: {0}")]
    Unavailable(String),
}

/// Result type alias for Geo Uplink
pub type Result<T> = std::result::Result<T, UplinkError>;
