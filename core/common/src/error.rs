//! Common error types for image backup operations.

use thiserror::Error;

/// Top-level error type for image backup operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Provider or application configuration is missing or invalid.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Network request failed.
    #[error("Network error: {0}")]
    Network(String),

    /// A single file transfer failed.
    #[error("Transfer error: {0}")]
    Transfer(String),

    /// Metadata persistence failed.
    #[error("Database error: {0}")]
    Database(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Credentials were rejected by the remote service.
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// The remote service refused the operation.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),
}

impl Error {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Network(_) | Error::Io(_) | Error::Transfer(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Error::Network("reset".to_string()).is_transient());
        assert!(Error::Io(std::io::Error::other("disk")).is_transient());
        assert!(Error::Transfer("stream cut".to_string()).is_transient());
        assert!(!Error::Authentication("bad token".to_string()).is_transient());
        assert!(!Error::Configuration("missing".to_string()).is_transient());
    }
}
