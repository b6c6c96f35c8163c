//! WebSocket transport layer.
//!
//! The transport is the collaborator that owns everything before a session
//! exists: the TCP listener, the HTTP upgrade handshake (including the
//! allowed-origin policy), and the plain-HTTP health check. Once a stream is
//! upgraded it is handed to the dispatcher and the transport never touches
//! it again.
//!
//! A handshake failure is terminal for that socket only - the connection was
//! never registered and the process keeps serving.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener, TcpStream},
};
use tokio_tungstenite::{
    WebSocketStream, accept_hdr_async,
    tungstenite::{
        handshake::server::{ErrorResponse, Request, Response},
        http::StatusCode,
    },
};

use crate::error::ServerError;

/// Body returned to plain-HTTP health probes, mirroring the deployment this
/// server fronts.
pub const HEALTH_BODY: &str = "Connects";

/// Bound on waiting for a complete request head before classifying the
/// socket. A peer that cannot finish its request head within this window is
/// classified on whatever arrived.
const HEAD_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Allowed-origin policy for the upgrade handshake.
///
/// An empty allow-list permits every origin. Requests without an `Origin`
/// header (non-browser clients) are always permitted; the header is a
/// browser-enforced protection, not an authentication mechanism.
#[derive(Debug, Clone, Default)]
pub struct OriginPolicy {
    allowed: Vec<String>,
}

impl OriginPolicy {
    /// Build a policy from the configured allow-list.
    #[must_use]
    pub fn new(allowed: Vec<String>) -> Self {
        Self { allowed }
    }

    /// Whether a handshake with this `Origin` header may proceed.
    #[must_use]
    pub fn permits(&self, origin: Option<&str>) -> bool {
        match origin {
            None => true,
            Some(origin) => {
                self.allowed.is_empty()
                    || self.allowed.iter().any(|allowed| allowed.eq_ignore_ascii_case(origin))
            },
        }
    }
}

/// TCP listener plus upgrade policy.
pub struct WsTransport {
    listener: TcpListener,
    policy: Arc<OriginPolicy>,
}

impl WsTransport {
    /// Bind the listener.
    pub async fn bind(address: &str, allowed_origins: Vec<String>) -> Result<Self, ServerError> {
        let addr: SocketAddr = address
            .parse()
            .map_err(|err| ServerError::Config(format!("invalid bind address '{address}': {err}")))?;

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|err| ServerError::Transport(format!("failed to bind {addr}: {err}")))?;

        tracing::info!("websocket transport bound to {addr}");

        Ok(Self { listener, policy: Arc::new(OriginPolicy::new(allowed_origins)) })
    }

    /// Accept one TCP connection. Blocks until a peer connects.
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr), ServerError> {
        self.listener
            .accept()
            .await
            .map_err(|err| ServerError::Transport(format!("accept failed: {err}")))
    }

    /// Local address the transport is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        self.listener
            .local_addr()
            .map_err(|err| ServerError::Transport(format!("failed to get local address: {err}")))
    }

    /// Upgrade policy, shareable with per-connection handshake tasks.
    #[must_use]
    pub fn policy(&self) -> Arc<OriginPolicy> {
        Arc::clone(&self.policy)
    }
}

/// Perform the WebSocket upgrade on one accepted socket.
///
/// Returns `Ok(None)` when the request was not a WebSocket upgrade at all:
/// the socket is answered with the constant health body and closed, with no
/// session created.
///
/// # Errors
///
/// `ServerError::Accept` on a failed handshake, including origin rejection.
pub async fn upgrade(
    mut stream: TcpStream,
    policy: Arc<OriginPolicy>,
) -> Result<Option<WebSocketStream<TcpStream>>, ServerError> {
    // Peek the request head without consuming it, so the handshake parser
    // still sees the full request. The head may arrive in several TCP
    // segments; classification waits for the terminating blank line (or a
    // full buffer) before deciding.
    let mut head = [0u8; 2048];
    let deadline = tokio::time::Instant::now() + HEAD_READ_TIMEOUT;
    let n = loop {
        let n = stream
            .peek(&mut head)
            .await
            .map_err(|err| ServerError::Transport(format!("peek failed: {err}")))?;

        if n == 0 {
            return Err(ServerError::Transport(
                "connection closed before a request head arrived".to_string(),
            ));
        }
        if head_is_complete(&head[..n]) || n == head.len() {
            break n;
        }
        if tokio::time::Instant::now() >= deadline {
            break n;
        }
        // peek is level-triggered: it returns the same bytes until more
        // arrive, so back off briefly instead of spinning.
        tokio::time::sleep(Duration::from_millis(5)).await;
    };

    if !is_websocket_upgrade(&head[..n]) {
        stream
            .write_all(health_response().as_bytes())
            .await
            .map_err(|err| ServerError::Transport(format!("health response failed: {err}")))?;
        let _ = stream.shutdown().await;
        return Ok(None);
    }

    let callback = move |request: &Request, response: Response| {
        let origin = request.headers().get("origin").and_then(|value| value.to_str().ok());
        if policy.permits(origin) {
            Ok(response)
        } else {
            tracing::debug!("rejecting upgrade from origin {origin:?}");
            let mut forbidden = ErrorResponse::new(Some("origin not allowed".to_string()));
            *forbidden.status_mut() = StatusCode::FORBIDDEN;
            Err(forbidden)
        }
    };

    let ws = accept_hdr_async(stream, callback)
        .await
        .map_err(|err| ServerError::Accept(err.to_string()))?;

    Ok(Some(ws))
}

/// Whether the peeked bytes contain a full request head (terminating blank
/// line included).
fn head_is_complete(head: &[u8]) -> bool {
    head.windows(4).any(|window| window == b"\r\n\r\n")
}

/// Whether the peeked request head looks like a WebSocket upgrade.
///
/// `Sec-WebSocket-Key` is mandatory on every upgrade request and appears in
/// nothing else, which makes it a reliable discriminator.
fn is_websocket_upgrade(head: &[u8]) -> bool {
    contains_ignore_ascii_case(head, b"sec-websocket-key")
}

fn contains_ignore_ascii_case(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|window| window.eq_ignore_ascii_case(needle))
}

fn health_response() -> String {
    format!(
        "HTTP/1.1 200 OK\r\ncontent-length: {}\r\ncontent-type: text/plain; charset=utf-8\r\nconnection: close\r\n\r\n{}",
        HEALTH_BODY.len(),
        HEALTH_BODY
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_allow_list_permits_everything() {
        let policy = OriginPolicy::new(Vec::new());
        assert!(policy.permits(None));
        assert!(policy.permits(Some("https://anywhere.example")));
    }

    #[test]
    fn allow_list_is_exact_but_case_insensitive() {
        let policy = OriginPolicy::new(vec!["https://app.example".to_string()]);
        assert!(policy.permits(Some("https://app.example")));
        assert!(policy.permits(Some("HTTPS://APP.EXAMPLE")));
        assert!(!policy.permits(Some("https://evil.example")));
        assert!(!policy.permits(Some("https://app.example.evil")));
    }

    #[test]
    fn missing_origin_is_permitted() {
        let policy = OriginPolicy::new(vec!["https://app.example".to_string()]);
        assert!(policy.permits(None));
    }

    #[test]
    fn head_completion_requires_the_blank_line() {
        assert!(!head_is_complete(b"GET /ws HTTP/1.1\r\nHost: localhost\r\n"));
        assert!(head_is_complete(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n"));
        assert!(!head_is_complete(b""));
    }

    #[test]
    fn upgrade_detection() {
        let upgrade = b"GET /ws HTTP/1.1\r\nHost: localhost\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\r\n";
        assert!(is_websocket_upgrade(upgrade));

        let plain = b"GET / HTTP/1.1\r\nHost: localhost\r\nAccept: */*\r\n\r\n";
        assert!(!is_websocket_upgrade(plain));

        assert!(!is_websocket_upgrade(b""));
    }

    #[test]
    fn health_response_is_well_formed() {
        let response = health_response();
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.ends_with("\r\n\r\nConnects"));
        assert!(response.contains("content-length: 8\r\n"));
    }

    #[tokio::test]
    async fn bind_rejects_invalid_address() {
        let result = WsTransport::bind("not-an-address", Vec::new()).await;
        assert!(matches!(result, Err(ServerError::Config(_))));
    }

    #[tokio::test]
    async fn bind_assigns_ephemeral_port() {
        let transport = WsTransport::bind("127.0.0.1:0", Vec::new()).await.unwrap();
        assert_ne!(transport.local_addr().unwrap().port(), 0);
    }
}
