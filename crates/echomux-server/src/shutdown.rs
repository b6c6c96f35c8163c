//! Shutdown coordinator.
//!
//! Drains the registry on process shutdown: every live connection receives a
//! concurrent close signal, then the coordinator waits up to the grace
//! period for the session tasks to exit on their own. Stragglers are
//! forcibly terminated (task aborted, stream severed) and reported as
//! warnings - a forced close is never fatal to the shutdown itself.
//!
//! The coordinator only signals; it never reads or writes a connection's
//! stream. Stream ownership stays with the session loop to its end.

use std::{sync::Arc, time::Duration};

use echomux_core::CloseReason;
use tokio::time::Instant;

use crate::{connection::ConnectionId, registry::ConnectionRegistry};

/// Outcome of a shutdown drain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Connections whose session loop exited within the grace period.
    pub closed: usize,
    /// Connections that had to be forcibly terminated.
    pub forced: Vec<ConnectionId>,
}

impl ShutdownReport {
    /// Whether every connection closed cleanly.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.forced.is_empty()
    }
}

/// Drains all live connections at process shutdown.
pub struct ShutdownCoordinator {
    registry: Arc<ConnectionRegistry>,
}

impl ShutdownCoordinator {
    /// Create a coordinator over the shared registry.
    #[must_use]
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    /// Close every connection, waiting up to `grace` in total.
    ///
    /// Registration is refused from the moment the drain begins, so a
    /// handshake still in flight when shutdown fires cannot slip a session
    /// past the snapshot. The close signal then goes out to the whole
    /// snapshot first, so all session loops unwind concurrently; the
    /// waiting that follows shares one deadline, bounding the entire drain
    /// by `grace` plus scheduling overhead.
    pub async fn shutdown(&self, grace: Duration) -> ShutdownReport {
        self.registry.begin_drain();
        let snapshot = self.registry.snapshot();
        tracing::info!("shutting down: draining {} connection(s)", snapshot.len());

        for handle in &snapshot {
            handle.close(CloseReason::ServerShutdown);
        }

        let deadline = Instant::now() + grace;
        let mut closed = 0;
        let mut forced = Vec::new();

        for handle in snapshot {
            let id = handle.id();
            let Some(mut task) = handle.take_task() else {
                // Dispatched but the task was never attached, or another
                // drain already claimed it; nothing left to wait for.
                closed += 1;
                continue;
            };

            let remaining = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, &mut task).await {
                Ok(join) => {
                    if let Err(err) = join {
                        tracing::debug!("connection {id}: session task join failed: {err}");
                    }
                    closed += 1;
                },
                Err(_) => {
                    // Grace expired: sever the stream by aborting the task,
                    // and take over the cleanup it will never run. Removal
                    // comes before the terminal state so the registry never
                    // holds a Closed connection.
                    task.abort();
                    self.registry.unregister(id);
                    handle.mark_closed();
                    tracing::warn!(
                        "connection {id}: forced close, session did not exit within {grace:?}"
                    );
                    forced.push(id);
                },
            }
        }

        tracing::info!("shutdown drain complete: {closed} closed, {} forced", forced.len());
        ShutdownReport { closed, forced }
    }
}
