//! Error types for Dropwire.
//!
//! This module provides a unified error type for all Dropwire operations,
//! with specific error variants for different failure modes.

use std::io;

use thiserror::Error;

use crate::protocol::TransferId;

/// A specialized `Result` type for Dropwire operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The main error type for Dropwire.
#[derive(Error, Debug)]
pub enum Error {
    /// Send attempted without an open channel (E001)
    #[error("no active connection")]
    NoActiveConnection,

    /// Session operation attempted outside the connected state (E002)
    #[error("session is not connected")]
    NotConnected,

    /// Corrupt or unparsable frame (E003)
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// Chunk or command referencing a transfer the registry does not know (E004)
    #[error("unknown transfer {0}")]
    UnknownTransfer(TransferId),

    /// Reassembled length disagrees with the declared size (E005)
    #[error("size mismatch: declared {expected} bytes, reassembled {actual} bytes")]
    SizeMismatch {
        /// Size declared in the metadata frame
        expected: u64,
        /// Length of the reassembled content
        actual: u64,
    },

    /// The underlying channel failed (E006)
    #[error("channel error: {0}")]
    ChannelError(String),

    /// Connection lost while a transfer was in flight
    #[error("connection lost")]
    ConnectionLost,

    /// Transfer was cancelled
    #[error("transfer cancelled")]
    TransferCancelled,

    /// File not found
    #[error("file not found: {0}")]
    FileNotFound(String),

    /// Invalid path
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// Invalid user input
    #[error("{0}")]
    InvalidInput(String),

    /// Configuration file error
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Internal error (should not happen)
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns the error code associated with this error, if any.
    ///
    /// Error codes follow the pattern EXXX where XXX is a 3-digit number.
    #[must_use]
    pub const fn code(&self) -> Option<&'static str> {
        match self {
            Self::NoActiveConnection => Some("E001"),
            Self::NotConnected => Some("E002"),
            Self::MalformedFrame(_) => Some("E003"),
            Self::UnknownTransfer(_) => Some("E004"),
            Self::SizeMismatch { .. } => Some("E005"),
            Self::ChannelError(_) => Some("E006"),
            _ => None,
        }
    }

    /// Returns whether this error only affects a single frame.
    ///
    /// Frame-level errors are logged and the frame dropped; the session keeps
    /// running.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::MalformedFrame(_) | Self::UnknownTransfer(_) | Self::SizeMismatch { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(Error::NoActiveConnection.code(), Some("E001"));
        assert_eq!(Error::NotConnected.code(), Some("E002"));
        assert_eq!(Error::MalformedFrame("x".into()).code(), Some("E003"));
        assert_eq!(Error::ConnectionLost.code(), None);
    }

    #[test]
    fn test_frame_errors_are_recoverable() {
        assert!(Error::MalformedFrame("bad tag".into()).is_recoverable());
        assert!(Error::UnknownTransfer(TransferId::new()).is_recoverable());
        assert!(!Error::ChannelError("reset".into()).is_recoverable());
        assert!(!Error::NoActiveConnection.is_recoverable());
    }

    #[test]
    fn test_size_mismatch_message() {
        let err = Error::SizeMismatch {
            expected: 10,
            actual: 8,
        };
        assert_eq!(
            err.to_string(),
            "size mismatch: declared 10 bytes, reassembled 8 bytes"
        );
    }
}
