//! # EventSub WebSocket Session
//!
//! One [`WsSession`] per user: connection establishment with the EventSub
//! subprotocol and auth headers, the welcome (and optional challenge)
//! handshake, timed send/receive, health tracking, and breaker-guarded
//! reconnection with backoff. The session engine drives this; nothing here
//! knows about subscriptions or chat semantics.

mod connector;
mod reconnect;
mod state;
mod transceiver;

pub use state::ConnectionState;
pub use transceiver::WsFrame;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use crate::breaker::{BreakerRegistry, CircuitBreaker};
use crate::config::RuntimeConfig;
use crate::error::{RuntimeError, RuntimeResult};

use connector::{WsConnector, WsStream};
use reconnect::Backoff;
use state::StateManager;
use transceiver::Transceiver;

/// Name of the breaker guarding WebSocket connects.
pub const WS_BREAKER_NAME: &str = "websocket_connection";

/// Connection attempts allowed before hygiene kicks in.
const MAX_CONNECTION_ATTEMPTS: u32 = 10;

/// Spacing of periodic hygiene sweeps.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(300);

/// A socket quiet for longer than this is closed during hygiene sweeps.
const STALE_SOCKET_AGE: Duration = Duration::from_secs(300);

/// A per-user EventSub WebSocket session.
pub struct WsSession {
    config: Arc<RuntimeConfig>,
    connector: WsConnector,
    state: Arc<StateManager>,
    socket: Arc<Mutex<Option<WsStream>>>,
    transceiver: Transceiver,
    breaker: Arc<CircuitBreaker>,
    backoff: Backoff,
    stop_signal: Notify,
    stop_requested: AtomicBool,
    connection_attempts: AtomicU32,
    last_cleanup: std::sync::Mutex<Instant>,
}

impl WsSession {
    /// Build a session against the configured EventSub URL.
    pub async fn new(
        config: Arc<RuntimeConfig>,
        breakers: &BreakerRegistry,
        token: &str,
        client_id: &str,
    ) -> Self {
        let breaker = breakers
            .get(WS_BREAKER_NAME, config.ws_breaker.clone())
            .await;
        let state = Arc::new(StateManager::new());
        let socket: Arc<Mutex<Option<WsStream>>> = Arc::new(Mutex::new(None));
        let transceiver = Transceiver::new(
            Arc::clone(&socket),
            Arc::clone(&state),
            config.ws_message_timeout,
        );
        Self {
            connector: WsConnector::new(config.eventsub_ws_url.clone(), token, client_id),
            backoff: Backoff::new(config.eventsub_max_backoff),
            config,
            state,
            socket,
            transceiver,
            breaker,
            stop_signal: Notify::new(),
            stop_requested: AtomicBool::new(false),
            connection_attempts: AtomicU32::new(0),
            last_cleanup: std::sync::Mutex::new(Instant::now()),
        }
    }

    // ─── Connection lifecycle ───────────────────────────────────────

    /// Connect and complete the welcome handshake.
    ///
    /// # Errors
    /// `Connection` on transport or handshake failure, `BreakerOpen` when
    /// the `websocket_connection` breaker is open.
    pub async fn connect(&self) -> RuntimeResult<()> {
        self.periodic_cleanup().await;
        if self.connection_attempts.load(Ordering::SeqCst) > MAX_CONNECTION_ATTEMPTS {
            tracing::error!("Too many connection attempts, backing off");
            return Err(RuntimeError::connection(
                "connect",
                "too many connection attempts",
            ));
        }

        let result = self
            .breaker
            .call(|| async {
                self.state.set_state(ConnectionState::Connecting);
                self.connection_attempts.fetch_add(1, Ordering::SeqCst);

                self.cleanup_socket().await;
                let ws = self.connector.connect().await?;
                {
                    *self.socket.lock().await = Some(ws);
                }
                self.state.set_socket_open(true);
                self.state.touch_activity();

                if let Some(challenge) = self.state.pending_challenge() {
                    self.handle_challenge(&challenge).await?;
                    self.state.set_pending_challenge(None);
                }
                self.process_welcome().await?;

                self.state.set_state(ConnectionState::Connected);
                self.state.set_pending_reconnect_session_id(None);
                tracing::info!(
                    session_id = self.state.session_id().as_deref().unwrap_or(""),
                    "WebSocket handshake complete"
                );
                Ok(())
            })
            .await;

        if result.is_err() {
            self.state.set_state(ConnectionState::Disconnected);
            self.state.set_socket_open(false);
        }
        result
    }

    /// Await the welcome frame and record the server-assigned session id.
    async fn process_welcome(&self) -> RuntimeResult<()> {
        let frame = self.transceiver.receive().await.map_err(|e| {
            RuntimeError::connection("welcome", format!("welcome not received: {e}"))
        })?;
        let WsFrame::Text(text) = frame else {
            return Err(RuntimeError::connection("welcome", "socket closed before welcome"));
        };

        let value: Value = serde_json::from_str(&text)
            .map_err(|e| RuntimeError::connection("welcome", format!("invalid welcome JSON: {e}")))?;
        let session_id = value
            .get("payload")
            .and_then(|p| p.get("session"))
            .and_then(|s| s.get("id"))
            .and_then(Value::as_str)
            .ok_or_else(|| RuntimeError::connection("welcome", "no session id in welcome"))?;

        self.state.set_session_id(Some(session_id.to_string()));
        Ok(())
    }

    /// Consume the challenge frame and echo the expected response.
    async fn handle_challenge(&self, expected: &str) -> RuntimeResult<()> {
        let frame = self.transceiver.receive().await.map_err(|e| {
            RuntimeError::connection("challenge", format!("challenge not received: {e}"))
        })?;
        let WsFrame::Text(text) = frame else {
            return Err(RuntimeError::connection("challenge", "socket closed during challenge"));
        };

        let value: Value = serde_json::from_str(&text).map_err(|e| {
            RuntimeError::connection("challenge", format!("invalid challenge JSON: {e}"))
        })?;
        let received = value
            .get("challenge")
            .and_then(Value::as_str)
            .ok_or_else(|| RuntimeError::connection("challenge", "missing challenge value"))?;
        if received != expected {
            return Err(RuntimeError::connection("challenge", "challenge mismatch"));
        }

        self.transceiver
            .send_json(&serde_json::json!({
                "type": "challenge_response",
                "challenge": received,
            }))
            .await?;
        tracing::info!("Challenge response sent");
        Ok(())
    }

    /// Close the socket and mark the session stopped.
    pub async fn disconnect(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        self.stop_signal.notify_waiters();
        self.state.set_state(ConnectionState::Disconnected);
        self.cleanup_socket().await;
        self.connection_attempts.store(0, Ordering::SeqCst);
    }

    async fn cleanup_socket(&self) {
        let mut guard = self.socket.lock().await;
        if let Some(mut ws) = guard.take() {
            if let Err(e) = ws.close(None).await {
                tracing::debug!(error = %e, "WebSocket close error");
            } else {
                tracing::info!("WebSocket disconnected");
            }
        }
        self.state.set_socket_open(false);
        self.state.set_session_id(None);
    }

    /// Periodic hygiene: every five minutes, close a socket that has been
    /// quiet past the stale age and clear the attempt counter.
    async fn periodic_cleanup(&self) {
        let due = {
            let mut last = self
                .last_cleanup
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if last.elapsed() > CLEANUP_INTERVAL {
                *last = Instant::now();
                true
            } else {
                false
            }
        };
        if !due {
            return;
        }
        if self.state.is_connected() && self.state.time_since_activity() > STALE_SOCKET_AGE {
            tracing::info!("Cleaning up stale WebSocket connection");
            self.cleanup_socket().await;
        }
        self.connection_attempts.store(0, Ordering::SeqCst);
    }

    // ─── Accessors ──────────────────────────────────────────────────

    pub fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    /// Open, CONNECTED, session id assigned, and recent traffic.
    pub fn is_healthy(&self) -> bool {
        self.state.is_healthy(self.config.stale_threshold)
    }

    pub fn session_id(&self) -> Option<String> {
        self.state.session_id()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state.state()
    }

    pub fn time_since_activity(&self) -> Duration {
        self.state.time_since_activity()
    }

    pub(crate) fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    /// Allow reconnects again after a `disconnect`.
    pub fn clear_stop(&self) {
        self.stop_requested.store(false, Ordering::SeqCst);
    }

    /// Replace the target URL (server-directed reconnect).
    pub async fn update_url(&self, new_url: &str) {
        self.connector.update_url(new_url).await;
    }

    /// Record the session id announced in a `session_reconnect` control
    /// message; cleared once the replacement connection completes its
    /// handshake.
    pub fn set_pending_reconnect_session_id(&self, session_id: Option<String>) {
        self.state.set_pending_reconnect_session_id(session_id);
    }

    pub fn pending_reconnect_session_id(&self) -> Option<String> {
        self.state.pending_reconnect_session_id()
    }

    /// Arm the challenge step of the next welcome handshake.
    pub fn set_pending_challenge(&self, challenge: Option<String>) {
        self.state.set_pending_challenge(challenge);
    }

    /// Swap the bearer token used for subsequent connects.
    pub async fn update_token(&self, new_token: &str) {
        self.connector.update_token(new_token).await;
    }

    // ─── Traffic ────────────────────────────────────────────────────

    /// Send a JSON value over the socket.
    ///
    /// # Errors
    /// `Connection { send }` when the socket is closed.
    pub async fn send_json(&self, value: &Value) -> RuntimeResult<()> {
        self.transceiver.send_json(value).await
    }

    /// Receive the next frame, bounded by the message timeout.
    ///
    /// # Errors
    /// `Timeout { receive }` on a quiet interval, `Connection { receive }`
    /// on a dead socket.
    pub async fn receive(&self) -> RuntimeResult<WsFrame> {
        self.transceiver.receive().await
    }

    /// Ping the peer when the connection has been idle past the heartbeat
    /// interval.
    pub async fn maybe_heartbeat(&self) {
        if self.state.is_connected() && self.state.time_since_activity() > self.config.ws_heartbeat
        {
            if let Err(e) = self.transceiver.ping().await {
                tracing::debug!(error = %e, "Heartbeat ping failed");
            }
        }
    }
}
