//! Error taxonomy shared by every layer of the crate.
//!
//! Transient conditions are ordinary variants rather than panics: a caller
//! that sees [`NetError::WouldBlock`] simply waits for the next readiness
//! notification. Hard disconnects and local policy violations are reported
//! once and never retried.

use std::{io, result::Result as StdResult, time::Duration};

use thiserror::Error;

pub type Result<T> = StdResult<T, NetError>;

#[derive(Debug, Error)]
pub enum NetError {
    /// The operation cannot complete now; retry once readiness fires.
    #[error("operation would block")]
    WouldBlock,
    /// The peer performed an orderly shutdown.
    #[error("peer closed the connection")]
    GracefulClose,
    #[error("connection reset by peer")]
    ConnectionReset,
    #[error("connection aborted")]
    ConnectionAborted,
    #[error("connection is shutting down")]
    ShutdownInProgress,
    #[error("buffer limit of {limit} bytes exceeded")]
    BufferOverflow { limit: usize },
    #[error("line exceeds maximum length of {max_len} bytes")]
    LineTooLong { max_len: usize },
    #[error("not enough data in buffer: requested {requested}, available {available}")]
    InsufficientData { requested: usize, available: usize },
    #[error("socket is closed")]
    Closed,
    #[error("descriptor {fd} is not registered with the event loop")]
    NotRegistered { fd: i32 },
    #[error("worker threads did not terminate within {0:?}")]
    ShutdownTimeout(Duration),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("{op} failed: {source}")]
    System {
        op: &'static str,
        #[source]
        source: io::Error,
    },
}

impl NetError {
    /// Translates the calling thread's current `errno`.
    pub fn from_errno(op: &'static str) -> Self {
        Self::from_io(op, io::Error::last_os_error())
    }

    /// Classifies an OS-level error into the taxonomy.
    pub fn from_io(op: &'static str, err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::WouldBlock {
            return NetError::WouldBlock;
        }
        match err.raw_os_error() {
            Some(libc::ECONNRESET) => NetError::ConnectionReset,
            Some(libc::ECONNABORTED) => NetError::ConnectionAborted,
            Some(libc::EPIPE) | Some(libc::ESHUTDOWN) => NetError::ShutdownInProgress,
            _ => NetError::System { op, source: err },
        }
    }

    pub fn is_would_block(&self) -> bool {
        matches!(self, NetError::WouldBlock)
    }

    /// Conditions that resolve by waiting for readiness.
    pub fn is_transient(&self) -> bool {
        self.is_would_block()
    }

    /// Conditions after which the connection must be considered closed.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            NetError::GracefulClose
                | NetError::ConnectionReset
                | NetError::ConnectionAborted
                | NetError::ShutdownInProgress
                | NetError::Closed
        )
    }

    /// The raw OS error code, if this error came from a syscall.
    pub fn os_code(&self) -> Option<i32> {
        match self {
            NetError::System { source, .. } => source.raw_os_error(),
            NetError::WouldBlock => Some(libc::EAGAIN),
            NetError::ConnectionReset => Some(libc::ECONNRESET),
            NetError::ConnectionAborted => Some(libc::ECONNABORTED),
            _ => None,
        }
    }
}
