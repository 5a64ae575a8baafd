//! Timed send/receive over the session socket.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;

use crate::error::{RuntimeError, RuntimeResult};

use super::connector::WsStream;
use super::state::StateManager;

const NOT_CONNECTED: &str = "WebSocket not connected";

/// Frames surfaced to the session engine. Control frames (ping/pong) are
/// absorbed here; tungstenite answers pings during the read/write cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsFrame {
    /// A text payload (all EventSub traffic is JSON text).
    Text(String),
    /// The peer closed the socket or the stream ended.
    Closed { reason: String },
}

/// Sends and receives frames with a bounded receive timeout, updating the
/// session's last-activity instant on any traffic.
pub(crate) struct Transceiver {
    socket: Arc<Mutex<Option<WsStream>>>,
    state: Arc<StateManager>,
    message_timeout: Duration,
}

impl Transceiver {
    pub(crate) fn new(
        socket: Arc<Mutex<Option<WsStream>>>,
        state: Arc<StateManager>,
        message_timeout: Duration,
    ) -> Self {
        Self {
            socket,
            state,
            message_timeout,
        }
    }

    /// Send a JSON value as a text frame.
    ///
    /// # Errors
    /// `Connection { send }` when the socket is absent or the send fails.
    pub(crate) async fn send_json(&self, value: &Value) -> RuntimeResult<()> {
        let mut guard = self.socket.lock().await;
        let ws = guard
            .as_mut()
            .ok_or_else(|| RuntimeError::connection("send", NOT_CONNECTED))?;
        ws.send(Message::Text(value.to_string().into()))
            .await
            .map_err(|e| RuntimeError::connection("send", e))?;
        self.state.touch_activity();
        Ok(())
    }

    /// Send a ping frame to provoke traffic on a quiet connection.
    ///
    /// # Errors
    /// `Connection { send }` when the socket is absent or the send fails.
    pub(crate) async fn ping(&self) -> RuntimeResult<()> {
        let mut guard = self.socket.lock().await;
        let ws = guard
            .as_mut()
            .ok_or_else(|| RuntimeError::connection("send", NOT_CONNECTED))?;
        ws.send(Message::Ping(Vec::new().into()))
            .await
            .map_err(|e| RuntimeError::connection("send", e))?;
        Ok(())
    }

    /// Receive the next text or close frame.
    ///
    /// # Errors
    /// `Timeout { receive }` when nothing arrives within the message
    /// timeout (the caller feeds this into its stale heuristic),
    /// `Connection { receive }` on socket absence or read error.
    pub(crate) async fn receive(&self) -> RuntimeResult<WsFrame> {
        let mut guard = self.socket.lock().await;
        let ws = guard
            .as_mut()
            .ok_or_else(|| RuntimeError::connection("receive", NOT_CONNECTED))?;

        loop {
            let msg = tokio::time::timeout(self.message_timeout, ws.next())
                .await
                .map_err(|_| RuntimeError::Timeout {
                    operation: "receive".into(),
                    seconds: self.message_timeout.as_secs(),
                })?;

            match msg {
                Some(Ok(Message::Text(text))) => {
                    self.state.touch_activity();
                    return Ok(WsFrame::Text(text.to_string()));
                }
                Some(Ok(Message::Close(frame))) => {
                    self.state.touch_activity();
                    let reason = frame
                        .map(|f| format!("code={} reason={}", f.code, f.reason))
                        .unwrap_or_else(|| "no close frame".to_string());
                    tracing::info!(%reason, "WebSocket closed by server");
                    return Ok(WsFrame::Closed { reason });
                }
                Some(Ok(_)) => {
                    // Ping/pong/binary: traffic counts as activity.
                    self.state.touch_activity();
                }
                Some(Err(e)) => {
                    return Err(RuntimeError::connection("receive", e));
                }
                None => {
                    return Ok(WsFrame::Closed {
                        reason: "stream ended".into(),
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_operations_on_missing_socket_raise_connection_error() {
        let socket = Arc::new(Mutex::new(None));
        let state = Arc::new(StateManager::new());
        let tx = Transceiver::new(socket, state, Duration::from_millis(50));

        let err = tx.send_json(&serde_json::json!({"a": 1})).await.unwrap_err();
        assert!(matches!(err, RuntimeError::Connection { operation, .. } if operation == "send"));

        let err = tx.receive().await.unwrap_err();
        assert!(
            matches!(err, RuntimeError::Connection { operation, .. } if operation == "receive")
        );
    }
}
