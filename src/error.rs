//! WolfSplit Error Types

use thiserror::Error;

/// Result type alias for WolfSplit operations
pub type Result<T> = std::result::Result<T, Error>;

/// WolfSplit error types
///
/// Per-statement routing failures are not errors of this type: they become
/// [`crate::router::RouteOutcome`] values because the client has to be told
/// about them with a protocol packet.
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Protocol errors
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Authentication failed for user '{0}'")]
    Auth(String),

    // Backend errors
    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    #[error("No master server available")]
    NoMasterAvailable,

    #[error("No backend servers available")]
    NoBackendsAvailable,

    #[error("Unknown server: {0}")]
    UnknownServer(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ConnectionTimeout(_)
                | Error::ConnectionFailed { .. }
                | Error::NoBackendsAvailable
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(Error::NoBackendsAvailable.is_retryable());
        assert!(Error::ConnectionTimeout("db1:3306".into()).is_retryable());
        assert!(!Error::Auth("app".into()).is_retryable());
        assert!(!Error::Config("bad".into()).is_retryable());
    }
}
