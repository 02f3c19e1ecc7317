//! Error types shared by every stage of the license monitor.
//!
//! Only failures that abort a cycle (or startup) are represented here.
//! Problems with the diagnostic tool or its output are deliberately absent:
//! those degrade to an "unlicensed" reading instead of an error.

use thiserror::Error;

/// Errors surfaced by configuration loading and the token refresh path.
#[derive(Debug, Error)]
pub enum LicenseError {
    /// Configuration is missing, malformed, or fails validation.
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// The HTTP request to the license server failed at the transport level.
    #[error("network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    /// The license server answered with a non-success status.
    #[error("server error: {0}")]
    ServerError(String),

    /// The token response carried no `Content-Disposition` header.
    #[error("license server response has no Content-Disposition header")]
    MissingContentDisposition,

    /// The `Content-Disposition` header was present but unusable.
    #[error("invalid Content-Disposition header: {0}")]
    InvalidContentDisposition(String),

    /// Reading or writing the token directory failed.
    #[error("storage error: {0}")]
    StorageError(#[from] std::io::Error),
}

impl From<config::ConfigError> for LicenseError {
    fn from(err: config::ConfigError) -> Self {
        LicenseError::ConfigError(err.to_string())
    }
}

/// Convenience alias used throughout the crate.
pub type LicenseResult<T> = Result<T, LicenseError>;
