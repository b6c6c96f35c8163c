//! Core logic for echomux: a concurrent WebSocket connection manager.
//!
//! This crate holds the pure (sans-IO) half of the system: the per-connection
//! lifecycle state machine, the echo reply transform, and the session error
//! taxonomy. Nothing here touches a socket or a runtime; time is passed in as
//! method arguments so every path is deterministically testable.
//!
//! The production runtime lives in `echomux-server`, which wraps this logic
//! with Tokio tasks and WebSocket transport.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod echo;
pub mod error;
pub mod lifecycle;

pub use echo::{ECHO_PREFIX, echo_reply};
pub use error::SessionError;
pub use lifecycle::{
    CloseReason, ConnectionConfig, ConnectionState, DEFAULT_IDLE_TIMEOUT,
    DEFAULT_MAX_OUTBOUND_QUEUE, Lifecycle,
};
