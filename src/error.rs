//! Error types for the Keyrate service.

use thiserror::Error;

/// Errors raised at the config source boundary.
///
/// Both variants are recoverable once the controller is running: the reload
/// loop logs them and keeps the last rule set that applied successfully.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    /// The backend could not be reached or the lookup key is absent
    #[error("Config fetch error: {0}")]
    Fetch(String),

    /// The payload was retrieved but is malformed
    #[error("Config parse error: {0}")]
    Parse(String),
}

/// Main error type for Keyrate operations.
#[derive(Error, Debug)]
pub enum KeyrateError {
    /// Service configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Rule source errors surfaced during bootstrap
    #[error(transparent)]
    Source(#[from] SourceError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for KeyrateError {
    fn from(err: config::ConfigError) -> Self {
        KeyrateError::Config(err.to_string())
    }
}

/// Result type alias for Keyrate operations.
pub type Result<T> = std::result::Result<T, KeyrateError>;
