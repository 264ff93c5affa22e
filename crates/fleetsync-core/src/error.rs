//! Error types for fleetsync-core

use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types
#[derive(Debug, Error)]
pub enum Error {
    /// Version string without a readable `major.minor`
    #[error("invalid version string: {0:?}")]
    InvalidVersion(String),

    /// Malformed inventory entry (expected `name` or `name@version`)
    #[error("invalid plugin spec: {0:?}")]
    InvalidPluginSpec(String),
}
