//! Echomux production server.
//!
//! A concurrent WebSocket echo server built on Tokio and tokio-tungstenite.
//! Every accepted connection gets its own session task; shared state is the
//! connection registry, which tracks live connections, enforces the capacity
//! limit, and gives the shutdown coordinator its working set.
//!
//! # Components
//!
//! - [`WsTransport`]: TCP listener, upgrade handshake, origin policy
//! - [`Dispatcher`]: turns upgraded streams into registered session tasks
//! - [`ConnectionRegistry`]: shared map of live connections
//! - [`ConnectionHandle`]: cross-task view of one connection
//! - [`ShutdownCoordinator`]: graceful drain with a bounded grace period
//!
//! Pure per-connection logic (lifecycle state machine, echo contract) lives
//! in [`echomux_core`] and is exercised here through the session loop.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod connection;
mod dispatcher;
mod error;
mod registry;
mod session;
mod shutdown;
mod transport;

use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

pub use connection::{ConnectionHandle, ConnectionId, OutboundMessage};
pub use dispatcher::Dispatcher;
use echomux_core::ConnectionConfig;
pub use error::ServerError;
pub use registry::ConnectionRegistry;
pub use shutdown::{ShutdownCoordinator, ShutdownReport};
use tokio::net::TcpStream;
pub use transport::{HEALTH_BODY, OriginPolicy, WsTransport, upgrade};

/// Default ceiling on concurrently registered connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10_000;

/// Default grace period granted to sessions during shutdown.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Server configuration for the production runtime.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to (e.g., "0.0.0.0:8080")
    pub bind_addr: String,
    /// Origins accepted during the upgrade handshake; empty allows all
    pub allowed_origins: Vec<String>,
    /// Ceiling on concurrently registered connections
    pub max_connections: usize,
    /// How long shutdown waits for sessions before forcing them closed
    pub grace_period: Duration,
    /// Per-connection configuration (idle timeout, outbound queue bound)
    pub connection: ConnectionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            allowed_origins: Vec::new(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            grace_period: DEFAULT_GRACE_PERIOD,
            connection: ConnectionConfig::default(),
        }
    }
}

/// Production echo server.
///
/// Owns the transport and the registry; [`Server::run_with_shutdown`] is the
/// whole lifetime of the process in one call.
pub struct Server {
    transport: WsTransport,
    registry: Arc<ConnectionRegistry>,
    dispatcher: Dispatcher,
    config: ServerConfig,
}

impl Server {
    /// Create and bind a new server.
    pub async fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        let transport =
            WsTransport::bind(&config.bind_addr, config.allowed_origins.clone()).await?;
        let registry = Arc::new(ConnectionRegistry::new());
        let dispatcher = Dispatcher::new(Arc::clone(&registry), config.clone());

        Ok(Self { transport, registry, dispatcher, config })
    }

    /// Local address the server is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        self.transport.local_addr()
    }

    /// Registry of live connections.
    #[must_use]
    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        Arc::clone(&self.registry)
    }

    /// Run the server until the process is killed.
    ///
    /// Accepts connections forever; use [`Server::run_with_shutdown`] when a
    /// graceful drain is wanted.
    pub async fn run(self) -> Result<(), ServerError> {
        self.run_with_shutdown(std::future::pending()).await?;
        Ok(())
    }

    /// Run the server until `shutdown` resolves, then drain.
    ///
    /// New connections stop being accepted the moment the signal fires,
    /// and registration is refused from the start of the drain, so a
    /// handshake still in flight cannot produce a session that outlives
    /// the shutdown. Live sessions are asked to close and given the
    /// configured grace period; whatever is still running afterwards is
    /// forced closed and reported in the returned [`ShutdownReport`].
    pub async fn run_with_shutdown<F>(self, shutdown: F) -> Result<ShutdownReport, ServerError>
    where
        F: Future<Output = ()> + Send,
    {
        tracing::info!("server listening on {}", self.transport.local_addr()?);

        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                () = &mut shutdown => break,
                accepted = self.transport.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let policy = self.transport.policy();
                        let dispatcher = self.dispatcher.clone();

                        // Handshakes run off the accept loop so one slow or
                        // malicious peer cannot stall admission.
                        tokio::spawn(async move {
                            if let Err(e) = serve_socket(stream, peer, policy, dispatcher).await {
                                tracing::debug!("connection from {peer} not admitted: {e}");
                            }
                        });
                    },
                    Err(e) => {
                        tracing::error!("accept error: {e}");
                    },
                },
            }
        }

        tracing::info!("shutdown requested, draining {} connections", self.registry.len());

        let coordinator = ShutdownCoordinator::new(Arc::clone(&self.registry));
        let report = coordinator.shutdown(self.config.grace_period).await;

        if report.is_clean() {
            tracing::info!("shutdown complete, {} sessions closed cleanly", report.closed);
        } else {
            tracing::warn!(
                "shutdown complete, {} closed cleanly, {} forced",
                report.closed,
                report.forced.len()
            );
        }

        Ok(report)
    }
}

/// Upgrade one accepted socket and hand it to the dispatcher.
async fn serve_socket(
    stream: TcpStream,
    peer: SocketAddr,
    policy: Arc<OriginPolicy>,
    dispatcher: Dispatcher,
) -> Result<(), ServerError> {
    match transport::upgrade(stream, policy).await? {
        Some(ws) => {
            let id = dispatcher.dispatch(ws)?;
            tracing::debug!("session {id} started for {peer}");
            Ok(())
        },
        None => {
            tracing::debug!("health check answered for {peer}");
            Ok(())
        },
    }
}
