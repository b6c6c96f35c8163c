//! Per-connection lifecycle state machine.
//!
//! Tracks one connection's progress through `Connecting → Open → Closing →
//! Closed`. Transitions are monotonic: once a state is left it is never
//! re-entered, and `Closed` is terminal. The state machine is pure - no I/O,
//! no clock access - so the server runtime passes time in as arguments, and
//! tests can fabricate any timing they need.
//!
//! Close is first-caller-wins: [`Lifecycle::begin_close`] reports whether the
//! caller initiated the close, so the session loop and the shutdown
//! coordinator can both request it concurrently without double-release.
//!
//! Generic over the `Instant` type to support both real time and virtual time
//! in deterministic tests.

use std::{
    fmt,
    ops::{Add, Sub},
    time::{Duration, Instant},
};

use crate::error::SessionError;

/// Maximum time allowed without any inbound activity before the connection is
/// considered idle and closed.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Default bound on the per-connection outbound queue.
pub const DEFAULT_MAX_OUTBOUND_QUEUE: usize = 64;

/// Connection state.
///
/// Transitions are monotonic in declaration order; there is no path from
/// `Closed` back to any earlier state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Stream accepted, handshake not yet confirmed by the dispatcher.
    Connecting,
    /// Fully established; frames flow in both directions.
    Open,
    /// Close requested; the session loop is draining and releasing.
    Closing,
    /// Terminal. Resources released, registry entry removed.
    Closed,
}

/// Why a connection was asked to close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The owning session loop finished (peer close, error, or timeout).
    SessionEnded,
    /// The shutdown coordinator is draining the process.
    ServerShutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SessionEnded => write!(f, "session-ended"),
            Self::ServerShutdown => write!(f, "server-shutdown"),
        }
    }
}

/// Per-connection configuration.
///
/// Supplied by the server's configuration surface at startup; the core never
/// reads environment or files.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Idle timeout before the session is terminated.
    pub idle_timeout: Duration,
    /// Bound on the outbound message queue; exceeding it is a backpressure
    /// failure.
    pub max_outbound_queue: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            max_outbound_queue: DEFAULT_MAX_OUTBOUND_QUEUE,
        }
    }
}

/// Lifecycle state machine for a single connection.
///
/// Owns the current state, the last-activity timestamp for idle detection,
/// and the recorded close reason. Exactly one session loop drives reads and
/// writes; other components interact only through the state transitions here.
#[derive(Debug, Clone)]
pub struct Lifecycle<I = Instant>
where
    I: Copy + Ord + Send + Sync + Sub<Output = Duration>,
{
    /// Current state.
    state: ConnectionState,
    /// Configuration (idle timeout, queue bound).
    config: ConnectionConfig,
    /// Last inbound activity timestamp.
    last_activity: I,
    /// Reason recorded by the first successful [`Self::begin_close`].
    close_reason: Option<CloseReason>,
}

impl<I> Lifecycle<I>
where
    I: Copy + Ord + Send + Sync + Sub<Output = Duration>,
{
    /// Create a new lifecycle in [`ConnectionState::Connecting`].
    pub fn new(now: I, config: ConnectionConfig) -> Self {
        Self { state: ConnectionState::Connecting, config, last_activity: now, close_reason: None }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Configuration this connection was created with.
    #[must_use]
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Reason recorded by the first close request. `None` while live.
    #[must_use]
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason
    }

    /// Whether the connection has not yet reached `Closed`.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.state != ConnectionState::Closed
    }

    /// Transition `Connecting → Open` once the handshake has completed.
    ///
    /// # Errors
    ///
    /// `SessionError::InvalidState` from any other state - in particular this
    /// enforces that a closed connection can never reopen.
    pub fn open(&mut self, now: I) -> Result<(), SessionError> {
        if self.state != ConnectionState::Connecting {
            return Err(SessionError::InvalidState { state: self.state, operation: "open" });
        }
        self.state = ConnectionState::Open;
        self.last_activity = now;
        Ok(())
    }

    /// Check that outbound traffic is currently allowed.
    ///
    /// # Errors
    ///
    /// `SessionError::InvalidState` unless the connection is `Open`.
    pub fn ensure_open(&self, operation: &'static str) -> Result<(), SessionError> {
        if self.state == ConnectionState::Open {
            Ok(())
        } else {
            Err(SessionError::InvalidState { state: self.state, operation })
        }
    }

    /// Request close. Returns `true` only for the first caller.
    ///
    /// Safe to call from any state: `Connecting` and `Open` transition to
    /// `Closing` and record the reason; `Closing` and `Closed` are no-ops
    /// returning `false`, which makes concurrent close requests idempotent.
    pub fn begin_close(&mut self, reason: CloseReason) -> bool {
        match self.state {
            ConnectionState::Connecting | ConnectionState::Open => {
                self.state = ConnectionState::Closing;
                self.close_reason = Some(reason);
                true
            },
            ConnectionState::Closing | ConnectionState::Closed => false,
        }
    }

    /// Mark the connection fully closed. Terminal and idempotent.
    pub fn finish_close(&mut self) {
        self.state = ConnectionState::Closed;
    }

    /// Record inbound activity (call when a frame arrives).
    pub fn record_activity(&mut self, now: I) {
        self.last_activity = now;
    }

    /// Last inbound activity timestamp.
    #[must_use]
    pub fn last_activity(&self) -> I {
        self.last_activity
    }

    /// Instant at which the connection becomes idle if nothing arrives.
    #[must_use]
    pub fn idle_deadline(&self) -> I
    where
        I: Add<Duration, Output = I>,
    {
        self.last_activity + self.config.idle_timeout
    }

    /// Elapsed time since last activity, if the idle timeout is exceeded.
    ///
    /// Only an `Open` connection can go idle; connecting and closing
    /// connections are governed by their own paths.
    #[must_use]
    pub fn check_idle(&self, now: I) -> Option<Duration> {
        if self.state != ConnectionState::Open {
            return None;
        }
        let elapsed = now - self.last_activity;
        if elapsed > self.config.idle_timeout { Some(elapsed) } else { None }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_lifecycle(t0: Instant) -> Lifecycle {
        let mut lc = Lifecycle::new(t0, ConnectionConfig::default());
        lc.open(t0).unwrap();
        lc
    }

    #[test]
    fn lifecycle_happy_path() {
        let t0 = Instant::now();
        let mut lc = Lifecycle::new(t0, ConnectionConfig::default());
        assert_eq!(lc.state(), ConnectionState::Connecting);
        assert!(lc.is_live());

        lc.open(t0).unwrap();
        assert_eq!(lc.state(), ConnectionState::Open);

        assert!(lc.begin_close(CloseReason::SessionEnded));
        assert_eq!(lc.state(), ConnectionState::Closing);
        assert_eq!(lc.close_reason(), Some(CloseReason::SessionEnded));

        lc.finish_close();
        assert_eq!(lc.state(), ConnectionState::Closed);
        assert!(!lc.is_live());
    }

    #[test]
    fn open_is_only_valid_from_connecting() {
        let t0 = Instant::now();
        let mut lc = open_lifecycle(t0);

        let result = lc.open(t0);
        assert!(matches!(
            result,
            Err(SessionError::InvalidState { state: ConnectionState::Open, .. })
        ));

        lc.begin_close(CloseReason::SessionEnded);
        lc.finish_close();

        // Closed is terminal: no path back to Open.
        let result = lc.open(t0);
        assert!(matches!(
            result,
            Err(SessionError::InvalidState { state: ConnectionState::Closed, .. })
        ));
        assert_eq!(lc.state(), ConnectionState::Closed);
    }

    #[test]
    fn first_close_wins() {
        let t0 = Instant::now();
        let mut lc = open_lifecycle(t0);

        assert!(lc.begin_close(CloseReason::ServerShutdown));
        assert!(!lc.begin_close(CloseReason::SessionEnded));

        // The reason from the first caller sticks.
        assert_eq!(lc.close_reason(), Some(CloseReason::ServerShutdown));
    }

    #[test]
    fn close_from_connecting_is_allowed() {
        let t0 = Instant::now();
        let mut lc = Lifecycle::new(t0, ConnectionConfig::default());

        assert!(lc.begin_close(CloseReason::ServerShutdown));
        assert_eq!(lc.state(), ConnectionState::Closing);
    }

    #[test]
    fn finish_close_is_idempotent() {
        let t0 = Instant::now();
        let mut lc = open_lifecycle(t0);
        lc.begin_close(CloseReason::SessionEnded);

        lc.finish_close();
        lc.finish_close();
        assert_eq!(lc.state(), ConnectionState::Closed);
    }

    #[test]
    fn ensure_open_rejects_other_states() {
        let t0 = Instant::now();
        let mut lc = Lifecycle::new(t0, ConnectionConfig::default());
        assert!(lc.ensure_open("enqueue").is_err());

        lc.open(t0).unwrap();
        assert!(lc.ensure_open("enqueue").is_ok());

        lc.begin_close(CloseReason::SessionEnded);
        assert!(matches!(
            lc.ensure_open("enqueue"),
            Err(SessionError::InvalidState { state: ConnectionState::Closing, .. })
        ));
    }

    #[test]
    fn idle_detection_tracks_activity() {
        let t0 = Instant::now();
        let config =
            ConnectionConfig { idle_timeout: Duration::from_secs(10), ..Default::default() };
        let mut lc = Lifecycle::new(t0, config);
        lc.open(t0).unwrap();

        assert!(lc.check_idle(t0 + Duration::from_secs(5)).is_none());
        assert_eq!(lc.check_idle(t0 + Duration::from_secs(11)), Some(Duration::from_secs(11)));

        // Activity resets the clock.
        lc.record_activity(t0 + Duration::from_secs(8));
        assert!(lc.check_idle(t0 + Duration::from_secs(11)).is_none());
        assert_eq!(lc.idle_deadline(), t0 + Duration::from_secs(18));
    }

    #[test]
    fn idle_does_not_apply_outside_open() {
        let t0 = Instant::now();
        let config =
            ConnectionConfig { idle_timeout: Duration::from_secs(1), ..Default::default() };
        let mut lc = Lifecycle::new(t0, config);

        let much_later = t0 + Duration::from_secs(3600);
        assert!(lc.check_idle(much_later).is_none());

        lc.open(t0).unwrap();
        lc.begin_close(CloseReason::SessionEnded);
        assert!(lc.check_idle(much_later).is_none());
    }

    #[test]
    fn close_reason_display() {
        assert_eq!(CloseReason::SessionEnded.to_string(), "session-ended");
        assert_eq!(CloseReason::ServerShutdown.to_string(), "server-shutdown");
    }
}
