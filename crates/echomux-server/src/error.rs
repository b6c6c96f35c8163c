//! Server error types.

use std::io;

use thiserror::Error;

use crate::connection::ConnectionId;

/// Errors that can occur in the server.
///
/// Per-connection session failures are not represented here - they are
/// handled entirely inside the owning session loop (see
/// `echomux_core::SessionError`) and never propagate across connections.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Configuration error (invalid bind address, bad option, etc.).
    ///
    /// Fatal at startup. Fix configuration and restart.
    #[error("configuration error: {0}")]
    Config(String),

    /// Transport/network error (bind failure, accept failure, I/O error).
    ///
    /// May be transient (network issues) or fatal (bind address in use).
    #[error("transport error: {0}")]
    Transport(String),

    /// WebSocket handshake failed for one incoming connection.
    ///
    /// Non-fatal to the process; the connection was never registered.
    #[error("websocket handshake failed: {0}")]
    Accept(String),

    /// The concurrent-connection limit is reached.
    ///
    /// The new connection is rejected; the process continues serving.
    #[error("connection limit reached ({limit})")]
    Capacity {
        /// Configured maximum number of concurrent connections.
        limit: usize,
    },

    /// The server is draining for shutdown.
    ///
    /// Registration is refused from the moment the drain begins; the
    /// process is about to exit.
    #[error("server is draining, connection refused")]
    Draining,

    /// A connection id was already present in the registry.
    ///
    /// Ids come from a monotonic counter, so this should never occur; it
    /// indicates a broken core invariant, not an operational condition.
    #[error("connection id already registered: {0}")]
    DuplicateId(ConnectionId),

    /// Internal error (unexpected state, logic bug).
    ///
    /// Should never happen in a correct implementation.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<io::Error> for ServerError {
    fn from(err: io::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages() {
        let err = ServerError::Capacity { limit: 100 };
        assert_eq!(err.to_string(), "connection limit reached (100)");

        let err = ServerError::Config("invalid bind address".to_string());
        assert_eq!(err.to_string(), "configuration error: invalid bind address");
    }

    #[test]
    fn io_errors_become_transport_errors() {
        let io = io::Error::new(io::ErrorKind::AddrInUse, "address in use");
        let err = ServerError::from(io);
        assert!(matches!(err, ServerError::Transport(_)));
    }
}
