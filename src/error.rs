//! Error types for netfile-client.

use thiserror::Error;

use crate::protocol::Status;

/// Main error type for all engine operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error on the underlying transport stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Caller-side misconfiguration (unbound builder, oversized buffer, etc.).
    /// Never retried.
    #[error("configuration error: {0}")]
    Config(String),

    /// Permission check against the connection/attachment failed before send.
    #[error("access denied: {0}")]
    Access(String),

    /// Protocol violation: malformed reply, truncated envelope, or a
    /// fragment arriving out of displacement order.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The server replied with an error status.
    #[error("server returned {0}")]
    Server(Status),

    /// Generic transport failure. Not safe to re-attempt.
    #[error("transport error: {0}")]
    Transport(String),

    /// Transport failure the worker explicitly marks as safe to re-attempt
    /// (connection loss mid-request). Feeds the bounded retry loops.
    #[error("restartable transport error: {0}")]
    TransportRestartable(String),

    /// The transport worker is gone and can accept no further messages.
    #[error("connection closed")]
    ConnectionClosed,
}

impl Error {
    /// Whether the bounded retry loops may re-attempt after this error.
    ///
    /// Only the distinguished restartable transport subset qualifies;
    /// everything else aborts on the first occurrence.
    pub fn is_restartable(&self) -> bool {
        match self {
            Error::TransportRestartable(_) => true,
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_restartable_classification() {
        assert!(Error::TransportRestartable("reset".into()).is_restartable());
        assert!(!Error::Transport("oops".into()).is_restartable());
        assert!(!Error::Config("bad".into()).is_restartable());
        assert!(!Error::ConnectionClosed.is_restartable());
        assert!(!Error::Protocol("fragment out of order".into()).is_restartable());
    }

    #[test]
    fn test_io_restartable_subset() {
        let reset = Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset by peer",
        ));
        assert!(reset.is_restartable());

        let denied = Error::Io(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "nope",
        ));
        assert!(!denied.is_restartable());
    }
}
