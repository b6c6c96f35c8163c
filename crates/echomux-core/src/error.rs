//! Session error taxonomy.
//!
//! Every error here is scoped to a single connection and terminal for that
//! connection only: the session loop logs it, closes its own connection, and
//! never lets it reach the dispatcher or any other session. The remote peer
//! sees an abrupt stream close; no error detail crosses the wire.
//!
//! We avoid `std::io::Error` for session logic to keep the failure kinds
//! distinguishable; conversions exist only at the transport boundary.

use std::{io, time::Duration};

use thiserror::Error;

use crate::lifecycle::ConnectionState;

/// Errors that terminate a single session.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Transport failure while reading a frame.
    #[error("read failed: {0}")]
    Read(String),

    /// The peer sent something that is not a well-formed text frame.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// No inbound activity within the configured idle timeout.
    #[error("idle timeout after {elapsed:?}")]
    Timeout {
        /// How long the connection sat idle.
        elapsed: Duration,
    },

    /// Transport failure while writing a frame.
    #[error("write failed: {0}")]
    Write(String),

    /// The bounded outbound queue is full.
    ///
    /// The caller decides policy; the session loop treats this as terminal,
    /// matching its fail-fast handling of every other frame failure.
    #[error("outbound queue full: {depth} queued, bound {bound}")]
    Backpressure {
        /// Messages currently queued.
        depth: usize,
        /// Configured queue bound.
        bound: usize,
    },

    /// Operation attempted in a state that does not permit it.
    #[error("invalid operation: cannot {operation} while {state:?}")]
    InvalidState {
        /// State the connection was in.
        state: ConnectionState,
        /// Operation that was attempted.
        operation: &'static str,
    },

    /// The connection is already closed.
    #[error("connection closed")]
    Closed,
}

impl SessionError {
    /// Whether this error is the idle-timeout kind.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Transport-boundary conversion: raw I/O failures surface as read errors.
impl From<io::Error> for SessionError {
    fn from(err: io::Error) -> Self {
        Self::Read(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_is_distinguishable() {
        assert!(SessionError::Timeout { elapsed: Duration::from_secs(61) }.is_timeout());
        assert!(!SessionError::Read("reset".to_string()).is_timeout());
        assert!(!SessionError::Backpressure { depth: 64, bound: 64 }.is_timeout());
    }

    #[test]
    fn display_messages() {
        let err = SessionError::Backpressure { depth: 64, bound: 64 };
        assert_eq!(err.to_string(), "outbound queue full: 64 queued, bound 64");

        let err = SessionError::InvalidState {
            state: ConnectionState::Closing,
            operation: "enqueue",
        };
        assert_eq!(err.to_string(), "invalid operation: cannot enqueue while Closing");
    }

    #[test]
    fn io_errors_become_read_errors() {
        let io = io::Error::new(io::ErrorKind::ConnectionReset, "peer reset");
        let err = SessionError::from(io);
        assert!(matches!(err, SessionError::Read(_)));
    }
}
