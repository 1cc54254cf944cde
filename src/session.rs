//! # Session State Machine
//!
//! Governs when capture and playback are permitted relative to connection and
//! handshake status, and drives the reconnect policy. The machine is pure:
//! it owns no sockets and no timers, it only reacts to events reported by the
//! transport and tells the caller what to do next (via [`ReconnectDirective`]).
//!
//! ## Session Lifecycle:
//! 1. **Connecting**: socket dial in progress
//! 2. **WarmingUp**: socket open, waiting for the backend `Ready` frame
//! 3. **Live**: handshake received, capture/playback permitted
//! 4. **Disconnected**: socket closed; terminal unless a reconnect is pending
//! 5. **Errored**: transport failed; a reconnect is pending
//!
//! Exactly one `Session` is active at a time. A session whose socket closed
//! is never revived: the reconnect timer constructs a fresh `Session` that
//! supersedes it, which is also the only way `handshake_received` ever goes
//! back to false.

use chrono::{DateTime, Utc};
use std::time::Duration;
use uuid::Uuid;

/// WebSocket close codes that end a session without a reconnect.
const NORMAL_CLOSE_CODES: [u16; 2] = [1000, 1001];

/// Current state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Connection attempt in progress
    Connecting,
    /// Socket open, waiting for the backend readiness handshake
    WarmingUp,
    /// Handshake received; audio may flow in both directions
    Live,
    /// Socket closed (terminal for this session instance)
    Disconnected,
    /// Transport error; a reconnect is pending
    Errored,
}

impl SessionState {
    /// Convert state to the status string exposed to the presentation layer.
    ///
    /// These strings are the only interface the UI needs from this core.
    pub fn as_str(&self) -> &str {
        match self {
            SessionState::Connecting => "connecting",
            SessionState::WarmingUp => "warming_up",
            SessionState::Live => "live",
            SessionState::Disconnected => "disconnected",
            SessionState::Errored => "error",
        }
    }
}

/// What the caller should do after an event was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDirective {
    /// Nothing to schedule; the session ended normally or was closed manually.
    None,
    /// Schedule exactly one reconnect after the given delay. A later manual
    /// close cancels it (check [`Session::take_pending_reconnect`] when the
    /// timer fires).
    After(Duration),
}

/// One logical conversation attempt between the client and the backend.
#[derive(Debug)]
pub struct Session {
    /// Unique identifier for this session instance
    session_id: String,

    /// Current state (see the state diagram in the module docs)
    state: SessionState,

    /// Latched true by the first `Ready` frame; never reset on this instance
    handshake_received: bool,

    /// Set when the session ends abnormally, cleared on manual close
    reconnect_deadline: Option<DateTime<Utc>>,

    /// Fixed reconnect delay (no backoff, reissued per abnormal close)
    reconnect_delay: Duration,

    /// When this session instance was created
    created_at: DateTime<Utc>,
}

impl Session {
    /// Create a fresh session in the `Connecting` state.
    pub fn new(reconnect_delay: Duration) -> Self {
        Self {
            session_id: Uuid::new_v4().to_string(),
            state: SessionState::Connecting,
            handshake_received: false,
            reconnect_deadline: None,
            reconnect_delay,
            created_at: Utc::now(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn handshake_received(&self) -> bool {
        self.handshake_received
    }

    pub fn reconnect_deadline(&self) -> Option<DateTime<Utc>> {
        self.reconnect_deadline
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Whether capture and playback are permitted right now.
    ///
    /// Both conditions are required: the socket must be live *and* the
    /// backend must have completed its readiness handshake.
    pub fn may_stream(&self) -> bool {
        self.state == SessionState::Live && self.handshake_received
    }

    /// The socket finished connecting: `Connecting` → `WarmingUp`.
    pub fn on_socket_open(&mut self) {
        if self.state == SessionState::Connecting {
            self.state = SessionState::WarmingUp;
            tracing::debug!(session_id = %self.session_id, "socket open, warming up");
        } else {
            tracing::warn!(
                session_id = %self.session_id,
                state = self.state.as_str(),
                "ignoring socket open outside Connecting"
            );
        }
    }

    /// A `Ready` frame arrived. Returns `true` exactly once per session, on
    /// the transition `WarmingUp` → `Live`; that is the caller's cue to
    /// initialize the playback clock. Duplicate `Ready` frames are ignored so
    /// the clock is never reset mid-session.
    pub fn on_ready_frame(&mut self) -> bool {
        match self.state {
            SessionState::WarmingUp if !self.handshake_received => {
                self.handshake_received = true;
                self.state = SessionState::Live;
                tracing::info!(session_id = %self.session_id, "backend ready, session live");
                true
            }
            _ => {
                tracing::debug!(
                    session_id = %self.session_id,
                    state = self.state.as_str(),
                    "ignoring redundant ready frame"
                );
                false
            }
        }
    }

    /// The socket closed with the given close code (or none at all).
    ///
    /// Normal codes (1000/1001) end the session with no reconnect. Anything
    /// else schedules exactly one reconnect after the fixed delay. A close
    /// reported after a manual close is terminal either way.
    pub fn on_socket_close(&mut self, code: Option<u16>) -> ReconnectDirective {
        if self.state == SessionState::Disconnected {
            // Already ended (e.g. manual close raced the close event).
            return ReconnectDirective::None;
        }

        let normal = code.map_or(false, |c| NORMAL_CLOSE_CODES.contains(&c));
        self.state = SessionState::Disconnected;

        if normal {
            self.reconnect_deadline = None;
            tracing::info!(session_id = %self.session_id, code = ?code, "session closed normally");
            ReconnectDirective::None
        } else {
            tracing::warn!(session_id = %self.session_id, code = ?code, "abnormal close");
            self.schedule_reconnect()
        }
    }

    /// A transport-level error occurred (backend unreachable, socket failure).
    ///
    /// Never crashes the process: degrades to `Errored` with a scheduled
    /// retry, exactly like an abnormal close.
    pub fn on_transport_error(&mut self, error: &str) -> ReconnectDirective {
        if self.state == SessionState::Disconnected {
            return ReconnectDirective::None;
        }
        tracing::warn!(session_id = %self.session_id, error = %error, "transport error");
        self.state = SessionState::Errored;
        self.schedule_reconnect()
    }

    /// The user explicitly disconnected. Cancels any pending reconnect; this
    /// session instance is now terminal.
    pub fn on_manual_close(&mut self) {
        self.reconnect_deadline = None;
        self.state = SessionState::Disconnected;
        tracing::info!(session_id = %self.session_id, "manual close");
    }

    /// Consume the pending reconnect when the timer fires.
    ///
    /// Returns `false` when a manual action cancelled the reconnect in the
    /// meantime, in which case the caller must not create a new session.
    pub fn take_pending_reconnect(&mut self) -> bool {
        self.reconnect_deadline.take().is_some()
    }

    fn schedule_reconnect(&mut self) -> ReconnectDirective {
        self.reconnect_deadline =
            Some(Utc::now() + chrono::Duration::from_std(self.reconnect_delay).unwrap_or_default());
        ReconnectDirective::After(self.reconnect_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DELAY: Duration = Duration::from_secs(4);

    fn live_session() -> Session {
        let mut session = Session::new(DELAY);
        session.on_socket_open();
        assert!(session.on_ready_frame());
        session
    }

    #[test]
    fn test_happy_path_reaches_live() {
        let mut session = Session::new(DELAY);
        assert_eq!(session.state(), SessionState::Connecting);
        assert!(!session.may_stream());

        session.on_socket_open();
        assert_eq!(session.state(), SessionState::WarmingUp);
        assert!(!session.may_stream());

        assert!(session.on_ready_frame());
        assert_eq!(session.state(), SessionState::Live);
        assert!(session.handshake_received());
        assert!(session.may_stream());
    }

    #[test]
    fn test_ready_latch_fires_exactly_once() {
        let mut session = live_session();
        // A duplicate Ready must not re-trigger the playback clock reset.
        assert!(!session.on_ready_frame());
        assert!(session.may_stream());
    }

    #[test]
    fn test_ready_before_open_is_ignored() {
        let mut session = Session::new(DELAY);
        assert!(!session.on_ready_frame());
        assert_eq!(session.state(), SessionState::Connecting);
        assert!(!session.handshake_received());
    }

    #[test]
    fn test_normal_close_schedules_no_reconnect() {
        for code in [1000, 1001] {
            let mut session = live_session();
            assert_eq!(session.on_socket_close(Some(code)), ReconnectDirective::None);
            assert_eq!(session.state(), SessionState::Disconnected);
            assert!(session.reconnect_deadline().is_none());
        }
    }

    #[test]
    fn test_abnormal_close_schedules_single_reconnect() {
        let mut session = live_session();
        assert_eq!(
            session.on_socket_close(Some(1006)),
            ReconnectDirective::After(DELAY)
        );
        assert!(session.reconnect_deadline().is_some());

        // The deadline is consumed exactly once.
        assert!(session.take_pending_reconnect());
        assert!(!session.take_pending_reconnect());
    }

    #[test]
    fn test_close_without_code_is_abnormal() {
        let mut session = live_session();
        assert_eq!(session.on_socket_close(None), ReconnectDirective::After(DELAY));
    }

    #[test]
    fn test_manual_close_cancels_pending_reconnect() {
        let mut session = live_session();
        session.on_socket_close(Some(1006));
        session.on_manual_close();

        // The timer fires after the manual close: no reconnect happens.
        assert!(!session.take_pending_reconnect());
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[test]
    fn test_transport_error_degrades_and_retries() {
        let mut session = Session::new(DELAY);
        session.on_socket_open();
        assert_eq!(
            session.on_transport_error("connection reset"),
            ReconnectDirective::After(DELAY)
        );
        assert_eq!(session.state(), SessionState::Errored);
        assert_eq!(session.state().as_str(), "error");
        assert!(!session.may_stream());
    }

    #[test]
    fn test_close_after_manual_close_is_terminal() {
        let mut session = live_session();
        session.on_manual_close();
        // The socket's own close event arrives afterwards.
        assert_eq!(session.on_socket_close(Some(1006)), ReconnectDirective::None);
        assert!(session.reconnect_deadline().is_none());
    }

    #[test]
    fn test_connect_failure_schedules_reconnect() {
        let mut session = Session::new(DELAY);
        assert_eq!(
            session.on_transport_error("dial failed"),
            ReconnectDirective::After(DELAY)
        );
    }

    #[test]
    fn test_status_strings() {
        assert_eq!(SessionState::Connecting.as_str(), "connecting");
        assert_eq!(SessionState::WarmingUp.as_str(), "warming_up");
        assert_eq!(SessionState::Live.as_str(), "live");
        assert_eq!(SessionState::Disconnected.as_str(), "disconnected");
        assert_eq!(SessionState::Errored.as_str(), "error");
    }
}
