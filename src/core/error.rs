use std::io;
use thiserror::Error;

/// Custom error types for modemlink
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Not connected to the modem application")]
    NotConnected,

    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("No free spectrum in the configured pass band")]
    NoFreeSpectrum,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),
}

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Creates a new connection error
    pub fn connection(msg: impl Into<String>) -> Self {
        Error::Connection(msg.into())
    }

    /// Creates a new malformed message error
    pub fn malformed(msg: impl Into<String>) -> Self {
        Error::MalformedMessage(msg.into())
    }

    /// Creates a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Creates a new invalid state error
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Error::InvalidState(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = Error::connection("test error");
        assert!(matches!(err, Error::Connection(_)));
        assert_eq!(err.to_string(), "Connection error: test error");
    }

    #[test]
    fn test_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::Other, "test");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_not_connected_display() {
        assert_eq!(
            Error::NotConnected.to_string(),
            "Not connected to the modem application"
        );
    }
}
