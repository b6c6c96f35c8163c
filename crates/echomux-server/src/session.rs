//! Per-connection session loop.
//!
//! Each connection is driven by exactly one Tokio task running [`run`]. The
//! loop reads text frames, applies the echo transform, and queues the reply
//! on the connection's bounded outbound queue, which the same loop drains to
//! the stream - so replies leave in submission order.
//!
//! Failure handling is fail-fast: a single read, write, timeout, or
//! backpressure failure terminates the session. The error is logged and
//! confined to this connection; nothing propagates to the dispatcher or to
//! other sessions. Cleanup (close, then unregister) always runs, whichever
//! exit path was taken.

use std::{sync::Arc, time::Duration};

use echomux_core::{CloseReason, SessionError, echo_reply};
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::{mpsc, watch},
};
use tokio_tungstenite::{
    WebSocketStream,
    tungstenite::{Error as WsError, Message},
};

use crate::{
    connection::{Connection, ConnectionHandle, OutboundMessage},
    registry::ConnectionRegistry,
};

/// Bound on the best-effort close handshake during cleanup. A peer that
/// refuses to take the close frame is abandoned rather than leaking the
/// task.
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// How a session came to its end without a session error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    /// The peer closed the stream cleanly.
    PeerClosed,
    /// A close was requested through the connection handle.
    CloseRequested(CloseReason),
}

/// Drive one connection until termination, then clean up.
pub(crate) async fn run<S>(conn: Connection<S>, registry: Arc<ConnectionRegistry>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let Connection { id, mut sink, mut stream, mut outbound, mut close_rx, handle } = conn;

    let end = drive(&handle, &mut sink, &mut stream, &mut outbound, &mut close_rx).await;
    match &end {
        Ok(SessionEnd::PeerClosed) => tracing::debug!("connection {id}: peer closed"),
        Ok(SessionEnd::CloseRequested(reason)) => {
            tracing::debug!("connection {id}: close requested ({reason})");
        },
        Err(err) => tracing::warn!("connection {id}: session terminated: {err}"),
    }

    // Cleanup always runs: close, deregister, mark closed, then best-effort
    // close handshake. The peer sees an abrupt close on error paths; no
    // error detail is echoed back. Removal comes before the terminal state
    // so the registry never holds a Closed connection.
    handle.close(CloseReason::SessionEnded);
    registry.unregister(id);
    handle.mark_closed();
    let _ = tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, sink.close()).await;
}

/// The read/echo/write loop.
///
/// The close signal is raced against the whole iteration, so it interrupts
/// promptly even while the loop is suspended in a read or a backpressured
/// write.
async fn drive<S>(
    handle: &ConnectionHandle,
    sink: &mut SplitSink<WebSocketStream<S>, Message>,
    stream: &mut SplitStream<WebSocketStream<S>>,
    outbound: &mut mpsc::Receiver<OutboundMessage>,
    close_rx: &mut watch::Receiver<Option<CloseReason>>,
) -> Result<SessionEnd, SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            changed = close_rx.changed() => {
                let reason = if changed.is_ok() {
                    (*close_rx.borrow_and_update()).unwrap_or(CloseReason::SessionEnded)
                } else {
                    CloseReason::SessionEnded
                };
                return Ok(SessionEnd::CloseRequested(reason));
            },
            step = iteration(handle, sink, stream, outbound) => match step? {
                Some(end) => return Ok(end),
                None => {},
            },
        }
    }
}

/// One step of the session loop: whichever of the idle deadline, a queued
/// outbound message, or an inbound frame is ready first.
///
/// Returns `Ok(None)` to keep looping, `Ok(Some(_))` on a normal end.
async fn iteration<S>(
    handle: &ConnectionHandle,
    sink: &mut SplitSink<WebSocketStream<S>, Message>,
    stream: &mut SplitStream<WebSocketStream<S>>,
    outbound: &mut mpsc::Receiver<OutboundMessage>,
) -> Result<Option<SessionEnd>, SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let deadline = tokio::time::Instant::from_std(handle.idle_deadline());

    tokio::select! {
        () = tokio::time::sleep_until(deadline) => {
            match handle.check_idle() {
                Some(elapsed) => Err(SessionError::Timeout { elapsed }),
                // Activity landed just before the deadline fired; the next
                // iteration recomputes it.
                None => Ok(None),
            }
        },
        queued = outbound.recv() => match queued {
            Some(msg) => {
                sink.send(Message::text(msg.text))
                    .await
                    .map_err(|err| SessionError::Write(err.to_string()))?;
                Ok(None)
            },
            // Every queue sender lives in a ConnectionHandle; with `handle`
            // borrowed here this arm cannot fire, but closing down is the
            // only sane reading of it.
            None => Ok(Some(SessionEnd::PeerClosed)),
        },
        frame = stream.next() => match frame {
            None => Ok(Some(SessionEnd::PeerClosed)),
            Some(Err(err)) => Err(read_error(err)),
            Some(Ok(Message::Text(text))) => {
                handle.touch();
                handle.enqueue(echo_reply(text.as_str()))?;
                Ok(None)
            },
            Some(Ok(Message::Close(_))) => Ok(Some(SessionEnd::PeerClosed)),
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                // tungstenite answers pings internally; both count as
                // activity for idle purposes.
                handle.touch();
                Ok(None)
            },
            Some(Ok(Message::Binary(_))) => {
                Err(SessionError::MalformedFrame("binary frame on a text session".to_string()))
            },
            // Raw frames never surface outside tungstenite internals.
            Some(Ok(Message::Frame(_))) => Ok(None),
        },
    }
}

/// Map a transport read failure onto the session taxonomy.
fn read_error(err: WsError) -> SessionError {
    match err {
        WsError::ConnectionClosed | WsError::AlreadyClosed => SessionError::Closed,
        WsError::Io(io) => SessionError::Read(io.to_string()),
        WsError::Protocol(violation) => SessionError::MalformedFrame(violation.to_string()),
        WsError::Capacity(cap) => SessionError::MalformedFrame(cap.to_string()),
        other => SessionError::Read(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use tokio_tungstenite::tungstenite::error::ProtocolError;

    use super::*;

    #[test]
    fn read_error_classification() {
        assert_eq!(read_error(WsError::ConnectionClosed), SessionError::Closed);

        let err = read_error(WsError::Io(io::Error::new(
            io::ErrorKind::ConnectionReset,
            "peer reset",
        )));
        assert!(matches!(err, SessionError::Read(_)));

        let err = read_error(WsError::Protocol(ProtocolError::InvalidOpcode(200)));
        assert!(matches!(err, SessionError::MalformedFrame(_)));
    }
}
