//! Connection state, activity tracking, and health checks.

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

/// WebSocket connection states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

struct StateInner {
    state: ConnectionState,
    socket_open: bool,
    session_id: Option<String>,
    pending_reconnect_session_id: Option<String>,
    pending_challenge: Option<String>,
    last_activity: Instant,
}

/// Tracks the session's connection state and last-activity instant.
///
/// A plain sync mutex: every critical section is a handful of field reads,
/// never an await.
pub(crate) struct StateManager {
    inner: Mutex<StateInner>,
}

impl StateManager {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(StateInner {
                state: ConnectionState::Disconnected,
                socket_open: false,
                session_id: None,
                pending_reconnect_session_id: None,
                pending_challenge: None,
                last_activity: Instant::now(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StateInner> {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.lock().state
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        self.lock().state = state;
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.lock().socket_open
    }

    pub(crate) fn set_socket_open(&self, open: bool) {
        self.lock().socket_open = open;
    }

    pub(crate) fn session_id(&self) -> Option<String> {
        self.lock().session_id.clone()
    }

    pub(crate) fn set_session_id(&self, id: Option<String>) {
        self.lock().session_id = id;
    }

    pub(crate) fn pending_reconnect_session_id(&self) -> Option<String> {
        self.lock().pending_reconnect_session_id.clone()
    }

    pub(crate) fn set_pending_reconnect_session_id(&self, id: Option<String>) {
        self.lock().pending_reconnect_session_id = id;
    }

    pub(crate) fn pending_challenge(&self) -> Option<String> {
        self.lock().pending_challenge.clone()
    }

    pub(crate) fn set_pending_challenge(&self, challenge: Option<String>) {
        self.lock().pending_challenge = challenge;
    }

    pub(crate) fn touch_activity(&self) {
        self.lock().last_activity = Instant::now();
    }

    pub(crate) fn time_since_activity(&self) -> Duration {
        self.lock().last_activity.elapsed()
    }

    /// Healthy means: socket open, handshake complete (CONNECTED with a
    /// session id), and traffic seen within the stale threshold.
    pub(crate) fn is_healthy(&self, stale_threshold: Duration) -> bool {
        let inner = self.lock();
        inner.socket_open
            && inner.state == ConnectionState::Connected
            && inner.session_id.is_some()
            && inner.last_activity.elapsed() <= stale_threshold
    }
}
