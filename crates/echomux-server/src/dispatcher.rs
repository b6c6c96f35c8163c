//! Dispatcher: turns accepted streams into running sessions.
//!
//! The transport layer hands over an already-upgraded WebSocket stream; the
//! dispatcher performs only bounded setup work - capacity check, connection
//! creation, registration, task spawn - so one slow accept can never delay
//! the others.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::WebSocketStream;

use crate::{
    connection::{Connection, ConnectionId},
    error::ServerError,
    registry::ConnectionRegistry,
    session, ServerConfig,
};

/// Spawns a session loop per accepted connection.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<ConnectionRegistry>,
    config: ServerConfig,
}

impl Dispatcher {
    /// Create a dispatcher over a shared registry.
    #[must_use]
    pub fn new(registry: Arc<ConnectionRegistry>, config: ServerConfig) -> Self {
        Self { registry, config }
    }

    /// Registry this dispatcher registers into.
    #[must_use]
    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        Arc::clone(&self.registry)
    }

    /// Accept one upgraded stream: create, register, and start its session.
    ///
    /// # Errors
    ///
    /// - `ServerError::Capacity` when the concurrent-connection limit is
    ///   reached; the stream is dropped and the peer sees an abrupt close.
    /// - `ServerError::DuplicateId` if the registry already holds the id - a
    ///   broken invariant (ids are monotonic), logged at error level and
    ///   surfaced so the caller rejects the connection; it is never
    ///   registered.
    pub fn dispatch<S>(&self, ws: WebSocketStream<S>) -> Result<ConnectionId, ServerError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let conn = Connection::open(ws, &self.config.connection);
        let handle = conn.handle();
        let id = handle.id();

        // A fresh connection is always Connecting; failure here is a logic
        // bug, not an operational condition.
        handle
            .mark_open()
            .map_err(|err| ServerError::Internal(format!("fresh connection failed to open: {err}")))?;

        match self.registry.register(handle.clone(), self.config.max_connections) {
            Ok(()) => {},
            Err(err @ ServerError::DuplicateId(_)) => {
                tracing::error!("registry invariant violated: {err}");
                return Err(err);
            },
            Err(err) => return Err(err),
        }

        let task = tokio::spawn(session::run(conn, Arc::clone(&self.registry)));
        handle.attach_task(task);

        tracing::debug!("connection {id} dispatched ({} live)", self.registry.len());
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use echomux_core::ConnectionConfig;
    use tokio_tungstenite::tungstenite::protocol::Role;

    use super::*;

    async fn server_ws() -> WebSocketStream<tokio::io::DuplexStream> {
        let (server_io, client_io) = tokio::io::duplex(4096);
        // Keep the client end alive for the duration of the test task.
        tokio::spawn(async move {
            let _client_io = client_io;
            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
        });
        WebSocketStream::from_raw_socket(server_io, Role::Server, None).await
    }

    fn test_config(max_connections: usize) -> ServerConfig {
        ServerConfig {
            max_connections,
            connection: ConnectionConfig::default(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn dispatch_registers_and_spawns() {
        let registry = Arc::new(ConnectionRegistry::new());
        let dispatcher = Dispatcher::new(Arc::clone(&registry), test_config(4));

        let id = dispatcher.dispatch(server_ws().await).unwrap();
        assert!(registry.contains(id));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn dispatch_rejects_over_capacity() {
        let registry = Arc::new(ConnectionRegistry::new());
        let dispatcher = Dispatcher::new(Arc::clone(&registry), test_config(1));

        dispatcher.dispatch(server_ws().await).unwrap();
        let err = dispatcher.dispatch(server_ws().await);
        assert!(matches!(err, Err(ServerError::Capacity { limit: 1 })));
        assert_eq!(registry.len(), 1);
    }
}
