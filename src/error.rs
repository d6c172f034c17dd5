//! Error types for ferrompi-serde

use std::io;

use thiserror::Error;

/// Result type for message-passing operations
pub type Result<T> = std::result::Result<T, Error>;

/// Classification of a failure reported by the transport.
///
/// Transports translate their native error codes into one of these classes
/// exactly once, at the failing call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Invalid buffer pointer or length
    Buffer,
    /// Invalid element count
    Count,
    /// Invalid source or destination rank
    Rank,
    /// Invalid tag
    Tag,
    /// Invalid or already consumed request handle
    Request,
    /// Received message was longer than the posted receive
    Truncate,
    /// Any other transport-specific code
    Other(i32),
}

impl ErrorClass {
    /// Map a raw transport error code onto a class.
    ///
    /// The numbering follows the common MPI error classes.
    pub fn from_code(code: i32) -> Self {
        match code {
            1 => ErrorClass::Buffer,
            2 => ErrorClass::Count,
            4 => ErrorClass::Tag,
            6 => ErrorClass::Rank,
            7 => ErrorClass::Request,
            15 => ErrorClass::Truncate,
            other => ErrorClass::Other(other),
        }
    }
}

/// Error types for message-passing operations
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid rank specified
    #[error("Invalid rank: {0}")]
    InvalidRank(i32),

    /// Invalid or already failed request handle
    #[error("Invalid request handle")]
    InvalidRequest,

    /// Invalid buffer provided
    #[error("Invalid buffer")]
    InvalidBuffer,

    /// Invalid count specified
    #[error("Invalid count: {0}")]
    InvalidCount(i64),

    /// Operation not supported
    #[error("Operation not supported: {0}")]
    NotSupported(String),

    /// Failure reported by the underlying transport
    #[error("Transport error ({class:?}): {message}")]
    Transport {
        /// Error class of the failing native call
        class: ErrorClass,
        /// Human-readable detail from the transport
        message: String,
    },

    /// A received array did not fit the destination buffer
    #[error("Received {received} elements into a buffer of {capacity}")]
    Overflow {
        /// Number of elements received
        received: usize,
        /// Length of the destination buffer
        capacity: usize,
    },

    /// The two sides of a transfer disagree about the wire protocol
    #[error("Protocol desynchronization: {0}")]
    Protocol(String),

    /// A value could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A receive was cancelled, so it has no value
    #[error("Request was cancelled")]
    Cancelled,

    /// `wait_any` or `wait_some` on a request list with no members
    #[error("Request list is empty")]
    EmptyRequestList,

    /// The scheduler driving a chunked transfer went away
    #[error("Transfer abandoned: {0}")]
    Disconnected(String),

    /// Invalid engine configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// I/O error from a byte stream
    #[error("I/O error: {0}")]
    Io(io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a transport error of the given class.
    pub fn transport(class: ErrorClass, message: impl Into<String>) -> Self {
        Error::Transport {
            class,
            message: message.into(),
        }
    }

    /// Create a transport error from a raw native error code.
    pub fn from_code(code: i32) -> Self {
        Error::transport(ErrorClass::from_code(code), format!("native error code {code}"))
    }

    /// The transport class of this error, if it came from the transport.
    pub fn class(&self) -> Option<ErrorClass> {
        match self {
            Error::Transport { class, .. } => Some(*class),
            _ => None,
        }
    }

    /// Unwrap an I/O error produced by the byte pipe.
    ///
    /// Errors raised inside pipe strategies travel through `std::io` as
    /// `io::Error::other(Error)`; this recovers the original.
    pub(crate) fn from_io(err: io::Error) -> Self {
        if err.get_ref().is_some_and(|inner| inner.is::<Error>()) {
            match err.into_inner().map(|inner| inner.downcast::<Error>()) {
                Some(Ok(inner)) => *inner,
                _ => Error::Internal("lost wrapped pipe error".into()),
            }
        } else {
            Error::Io(err)
        }
    }

    /// Wrap this error for transport through a `std::io` interface.
    pub(crate) fn into_io(self) -> io::Error {
        match self {
            Error::Io(err) => err,
            other => io::Error::other(other),
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::from_io(err)
    }
}
