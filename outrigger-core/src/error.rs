//! Error types shared by every Outrigger crate.
//!
//! Each operation in the engine fails with exactly one error kind. The type
//! is `Copy` so a single failure can be fanned out to every callback still
//! pending on a socket without cloning machinery.

use std::io;
use thiserror::Error;

/// The failure kind of an engine operation.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Error {
    /// The operation or one of its arguments is not valid in the current
    /// socket state.
    #[error("invalid operation or argument")]
    Invalid,

    /// The operation cannot complete now and has not been enqueued.
    #[error("operation would block")]
    WouldBlock,

    /// The peer has shut down its half of the connection and no buffered
    /// data remains.
    #[error("end of file")]
    Eof,

    /// The operation was cancelled before it completed.
    #[error("operation cancelled")]
    Cancelled,

    /// A configured limit (connection count, queue depth) was reached.
    #[error("limit reached")]
    Limit,

    /// The operation did not complete before its deadline.
    #[error("operation timed out")]
    Timeout,

    /// The operation is recognized but not implemented.
    #[error("not implemented")]
    NotImplemented,

    /// The transport failed; the socket is no longer usable.
    #[error("transport failure")]
    Transport,
}

/// Result type alias for Outrigger operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Check whether this error indicates the socket itself has failed.
    ///
    /// A fatal error initiates a full shutdown; every other kind leaves the
    /// socket state unchanged.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Transport)
    }

    /// Check whether this error is a transient condition the caller may
    /// retry after the corresponding readiness or watermark event.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::WouldBlock | Self::Limit | Self::Timeout)
    }
}

impl From<io::Error> for Error {
    fn from(error: io::Error) -> Self {
        match error.kind() {
            io::ErrorKind::WouldBlock => Self::WouldBlock,
            io::ErrorKind::TimedOut => Self::Timeout,
            io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData => Self::Invalid,
            io::ErrorKind::UnexpectedEof => Self::Eof,
            io::ErrorKind::Interrupted => Self::Cancelled,
            io::ErrorKind::Unsupported => Self::NotImplemented,
            _ => Self::Transport,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatality() {
        assert!(Error::Transport.is_fatal());
        assert!(!Error::WouldBlock.is_fatal());
        assert!(!Error::Eof.is_fatal());
        assert!(!Error::Cancelled.is_fatal());
    }

    #[test]
    fn test_io_error_mapping() {
        let e = io::Error::new(io::ErrorKind::WouldBlock, "try again");
        assert_eq!(Error::from(e), Error::WouldBlock);

        let e = io::Error::new(io::ErrorKind::ConnectionReset, "reset by peer");
        assert_eq!(Error::from(e), Error::Transport);

        let e = io::Error::new(io::ErrorKind::TimedOut, "deadline");
        assert_eq!(Error::from(e), Error::Timeout);
    }
}
