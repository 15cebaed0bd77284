//! Error types for connection operations.

use std::io;

use thiserror::Error;

use crate::channel::Direction;

/// Coarse classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transport,
    PeerClosed,
    EmptyMessage,
    AlreadyStarted,
    Spawn,
    HandlerPanicked,
}

/// Errors that can occur on a duplex connection.
///
/// Errors are cloneable so that a failure recorded by a worker can be
/// handed out to any number of callers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The underlying socket failed while sending or receiving.
    #[error("transport failure ({kind:?}): {message}")]
    Transport {
        kind: io::ErrorKind,
        message: String,
    },

    /// The peer closed the stream where data was expected.
    #[error("connection closed by peer")]
    PeerClosed,

    /// Zero-length messages cannot be queued for sending.
    #[error("zero-length messages cannot be sent")]
    EmptyMessage,

    /// The worker for this direction has already been started.
    #[error("{0} worker already started")]
    AlreadyStarted(Direction),

    /// The OS refused to spawn a worker thread.
    #[error("failed to spawn {0} worker: {1}")]
    Spawn(Direction, String),

    /// The receive handler panicked while processing a message.
    #[error("receive handler panicked: {0}")]
    HandlerPanicked(String),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Transport { .. } => ErrorKind::Transport,
            Error::PeerClosed => ErrorKind::PeerClosed,
            Error::EmptyMessage => ErrorKind::EmptyMessage,
            Error::AlreadyStarted(_) => ErrorKind::AlreadyStarted,
            Error::Spawn(..) => ErrorKind::Spawn,
            Error::HandlerPanicked(_) => ErrorKind::HandlerPanicked,
        }
    }

    /// Returns true if this error came from the socket itself.
    pub fn is_transport(&self) -> bool {
        self.kind() == ErrorKind::Transport
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Transport {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> io::Error {
        let kind = match &err {
            Error::Transport { kind, .. } => *kind,
            Error::PeerClosed => io::ErrorKind::UnexpectedEof,
            Error::EmptyMessage => io::ErrorKind::InvalidInput,
            _ => io::ErrorKind::Other,
        };
        io::Error::new(kind, err)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
