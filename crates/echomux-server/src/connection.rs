//! Connection wrapper and shared handle.
//!
//! A [`Connection`] owns one accepted, already-upgraded WebSocket stream
//! (split into sink and stream halves), the receiving end of its bounded
//! outbound queue, and the close-signal receiver. It is consumed by the
//! session loop, which is the only code that ever touches the stream.
//!
//! A [`ConnectionHandle`] is the cloneable view stored in the registry. It
//! carries the lifecycle state machine, the outbound queue sender, and the
//! close signal - everything another component (the shutdown coordinator, an
//! operator surface) may legitimately poke without racing the session loop
//! on the stream itself.

use std::sync::{
    Arc, Mutex, PoisonError,
    atomic::{AtomicU64, Ordering},
};
use std::{fmt, time::Instant};

use echomux_core::{CloseReason, ConnectionConfig, ConnectionState, Lifecycle, SessionError};
use futures_util::{
    StreamExt,
    stream::{SplitSink, SplitStream},
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tokio_tungstenite::{WebSocketStream, tungstenite::Message};

/// Opaque unique connection identifier.
///
/// Allocated from a process-wide monotonic counter, so two live connections
/// can never share an id; a duplicate observed by the registry is therefore
/// a broken invariant, not a collision to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

impl ConnectionId {
    /// Allocate the next id.
    pub(crate) fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One message queued for delivery to a connection's peer.
///
/// The target connection is implied by the queue the message sits in;
/// messages for one connection are written to the stream in submission
/// order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    /// Text payload of the frame to send.
    pub text: String,
}

/// State shared between a connection's handle clones.
struct Shared {
    lifecycle: Mutex<Lifecycle>,
    outbound_tx: mpsc::Sender<OutboundMessage>,
    close_tx: watch::Sender<Option<CloseReason>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Cloneable handle to a live connection.
///
/// Stored in the registry; safe to use concurrently from the session loop
/// and the shutdown coordinator. The handle never reads or writes the
/// underlying stream - it only signals.
#[derive(Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    shared: Arc<Shared>,
}

impl ConnectionHandle {
    /// Identifier of the connection this handle refers to.
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.lifecycle().state()
    }

    /// Whether the connection has not yet reached `Closed`.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.lifecycle().is_live()
    }

    /// Number of messages currently waiting in the outbound queue.
    #[must_use]
    pub fn queue_depth(&self) -> usize {
        let tx = &self.shared.outbound_tx;
        tx.max_capacity() - tx.capacity()
    }

    /// Queue a frame for delivery to the peer, in submission order.
    ///
    /// # Errors
    ///
    /// - `SessionError::InvalidState` if the connection is not `Open`
    /// - `SessionError::Backpressure` if the bounded queue is full
    /// - `SessionError::Closed` if the session loop is gone
    pub fn enqueue(&self, text: String) -> Result<(), SessionError> {
        let bound = {
            let lifecycle = self.lifecycle();
            lifecycle.ensure_open("enqueue")?;
            lifecycle.config().max_outbound_queue
        };

        self.shared.outbound_tx.try_send(OutboundMessage { text }).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => {
                SessionError::Backpressure { depth: bound, bound }
            },
            mpsc::error::TrySendError::Closed(_) => SessionError::Closed,
        })
    }

    /// Request close. Idempotent; returns `true` only for the caller that
    /// initiated it.
    ///
    /// The first caller transitions the lifecycle to `Closing` and fires the
    /// close signal, which promptly interrupts the session loop even while
    /// it is blocked in a read or write. Later callers are no-ops.
    pub fn close(&self, reason: CloseReason) -> bool {
        let initiated = self.lifecycle().begin_close(reason);
        if initiated {
            // Receiver may already be gone if the session loop exited first.
            let _ = self.shared.close_tx.send(Some(reason));
        }
        initiated
    }

    /// Transition `Connecting → Open` once the dispatcher has confirmed the
    /// handshake.
    pub(crate) fn mark_open(&self) -> Result<(), SessionError> {
        self.lifecycle().open(Instant::now())
    }

    /// Mark the connection fully closed. Terminal and idempotent.
    pub(crate) fn mark_closed(&self) {
        self.lifecycle().finish_close();
    }

    /// Record inbound activity for idle detection.
    pub(crate) fn touch(&self) {
        self.lifecycle().record_activity(Instant::now());
    }

    /// Instant at which the connection goes idle absent further activity.
    pub(crate) fn idle_deadline(&self) -> Instant {
        self.lifecycle().idle_deadline()
    }

    /// Idle-timeout check against the current clock.
    pub(crate) fn check_idle(&self) -> Option<std::time::Duration> {
        self.lifecycle().check_idle(Instant::now())
    }

    /// Store the session task after spawning it.
    pub(crate) fn attach_task(&self, task: JoinHandle<()>) {
        *self.shared.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);
    }

    /// Take the session task for joining or aborting. `None` if already
    /// taken or never attached.
    pub(crate) fn take_task(&self) -> Option<JoinHandle<()>> {
        self.shared.task.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    fn lifecycle(&self) -> std::sync::MutexGuard<'_, Lifecycle> {
        self.shared.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("queue_depth", &self.queue_depth())
            .finish()
    }
}

/// One accepted connection, exclusively owned by its session loop.
pub struct Connection<S> {
    /// Identifier, mirrored from the handle.
    pub(crate) id: ConnectionId,
    /// Write half of the WebSocket stream.
    pub(crate) sink: SplitSink<WebSocketStream<S>, Message>,
    /// Read half of the WebSocket stream.
    pub(crate) stream: SplitStream<WebSocketStream<S>>,
    /// Receiving end of the bounded outbound queue.
    pub(crate) outbound: mpsc::Receiver<OutboundMessage>,
    /// Fires when any handle requests close.
    pub(crate) close_rx: watch::Receiver<Option<CloseReason>>,
    /// Shared handle, also held by the registry.
    pub(crate) handle: ConnectionHandle,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap a freshly accepted, already-upgraded WebSocket stream.
    ///
    /// The connection starts in `Connecting`; the dispatcher moves it to
    /// `Open` after registering it.
    pub fn open(ws: WebSocketStream<S>, config: &ConnectionConfig) -> Self {
        let id = ConnectionId::next();
        let (outbound_tx, outbound_rx) = mpsc::channel(config.max_outbound_queue);
        let (close_tx, close_rx) = watch::channel(None);
        let (sink, stream) = ws.split();

        let handle = ConnectionHandle {
            id,
            shared: Arc::new(Shared {
                lifecycle: Mutex::new(Lifecycle::new(Instant::now(), config.clone())),
                outbound_tx,
                close_tx,
                task: Mutex::new(None),
            }),
        };

        Self { id, sink, stream, outbound: outbound_rx, close_rx, handle }
    }

    /// Identifier of this connection.
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Cloneable handle for the registry and coordinators.
    #[must_use]
    pub fn handle(&self) -> ConnectionHandle {
        self.handle.clone()
    }
}
