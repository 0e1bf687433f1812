//! Network error types

use std::io;

/// Network result type
pub type Result<T> = std::result::Result<T, Error>;

/// Network errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A required field is missing or invalid at an action boundary
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The engine's current state forbids the operation
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Unknown client: {0}")]
    UnknownClient(String),

    /// Another live session already holds this client id
    #[error("Duplicate client: {0}")]
    DuplicateClient(String),

    /// The peer refused our handshake
    #[error("Connection rejected: {0}")]
    Rejected(String),

    #[error("Unknown event: {0}")]
    UnknownEvent(String),

    #[error("Bind failed: {0}")]
    Bind(#[source] io::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Timed out")]
    Timeout,
}

impl Error {
    /// Transient failures of an established or establishing link.
    ///
    /// These drive reconnection and session teardown rather than being
    /// surfaced to the caller of an unrelated method.
    pub fn is_link_error(&self) -> bool {
        matches!(self, Error::Io(_) | Error::ConnectionClosed | Error::Timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_error_classification() {
        assert!(Error::ConnectionClosed.is_link_error());
        assert!(Error::Timeout.is_link_error());
        assert!(Error::Io(io::Error::from(io::ErrorKind::BrokenPipe)).is_link_error());

        assert!(!Error::NotConnected.is_link_error());
        assert!(!Error::Protocol("bad".into()).is_link_error());
        assert!(!Error::Rejected("dup".into()).is_link_error());
    }
}
