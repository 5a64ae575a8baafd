#![allow(dead_code)]

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};

pub const STEP_TIMEOUT: Duration = Duration::from_secs(5);

enum ConnectionCommand {
    SendJson(Value),
    ForceClose,
}

/// One accepted client connection, scriptable from the test body.
pub struct MockConnection {
    index: usize,
    frame_rx: mpsc::Receiver<Value>,
    command_tx: mpsc::Sender<ConnectionCommand>,
}

impl MockConnection {
    pub fn index(&self) -> usize {
        self.index
    }

    /// Next JSON frame the client sent.
    pub async fn recv_frame(&mut self) -> Value {
        timeout(STEP_TIMEOUT, self.frame_rx.recv())
            .await
            .expect("timed out waiting for client frame")
            .expect("mock connection frame channel closed")
    }

    pub async fn send_json(&self, value: Value) {
        self.command_tx
            .send(ConnectionCommand::SendJson(value))
            .await
            .expect("failed to send command to mock connection");
    }

    pub async fn send_welcome(&self, session_id: &str) {
        self.send_json(json!({
            "metadata": {"message_type": "session_welcome"},
            "payload": {"session": {"id": session_id, "status": "connected"}},
        }))
        .await;
    }

    pub async fn send_keepalive(&self) {
        self.send_json(json!({
            "metadata": {"message_type": "session_keepalive"},
            "payload": {},
        }))
        .await;
    }

    pub async fn send_session_reconnect(&self, reconnect_url: &str) {
        self.send_json(json!({
            "metadata": {"message_type": "session_reconnect"},
            "payload": {"session": {"reconnect_url": reconnect_url}},
        }))
        .await;
    }

    pub async fn send_chat_message(&self, chatter: &str, broadcaster: &str, text: &str) {
        self.send_json(json!({
            "metadata": {"message_type": "notification"},
            "payload": {
                "subscription": {"type": "channel.chat.message"},
                "event": {
                    "chatter_user_name": chatter,
                    "broadcaster_user_name": broadcaster,
                    "message": {"text": text},
                },
            },
        }))
        .await;
    }

    pub async fn force_close(&self) {
        let _ = self.command_tx.send(ConnectionCommand::ForceClose).await;
    }
}

/// Scripted EventSub WebSocket server accepting any number of client
/// connections, each surfaced as a [`MockConnection`].
pub struct MockEventSubServer {
    addr: SocketAddr,
    connection_rx: mpsc::Receiver<MockConnection>,
    server_task: JoinHandle<()>,
}

impl MockEventSubServer {
    pub async fn start() -> std::io::Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let addr = listener.local_addr()?;
        let (connection_tx, connection_rx) = mpsc::channel(16);
        let next_index = Arc::new(AtomicUsize::new(0));

        let server_task = tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(_) => break,
                };

                let connection_tx = connection_tx.clone();
                let index = next_index.fetch_add(1, Ordering::SeqCst);

                tokio::spawn(async move {
                    let callback = |req: &Request, mut response: Response| {
                        if let Some(protocol) = req.headers().get("Sec-WebSocket-Protocol") {
                            response
                                .headers_mut()
                                .insert("Sec-WebSocket-Protocol", protocol.clone());
                        }
                        Ok(response)
                    };
                    let ws_stream = match accept_hdr_async(stream, callback).await {
                        Ok(ws) => ws,
                        Err(_) => return,
                    };

                    let (mut ws_sink, mut ws_source) = ws_stream.split();
                    let (frame_tx, frame_rx) = mpsc::channel(64);
                    let (command_tx, mut command_rx) = mpsc::channel(64);

                    let connection = MockConnection {
                        index,
                        frame_rx,
                        command_tx: command_tx.clone(),
                    };
                    if connection_tx.send(connection).await.is_err() {
                        return;
                    }

                    loop {
                        tokio::select! {
                            maybe_command = command_rx.recv() => {
                                match maybe_command {
                                    Some(ConnectionCommand::SendJson(value)) => {
                                        let message = Message::Text(value.to_string().into());
                                        if ws_sink.send(message).await.is_err() {
                                            break;
                                        }
                                    }
                                    Some(ConnectionCommand::ForceClose) | None => break,
                                }
                            }
                            maybe_message = ws_source.next() => {
                                match maybe_message {
                                    Some(Ok(Message::Text(text))) => {
                                        if let Ok(value) = serde_json::from_str::<Value>(&text) {
                                            let _ = frame_tx.send(value).await;
                                        }
                                    }
                                    Some(Ok(Message::Close(_))) => break,
                                    Some(Ok(_)) => {}
                                    Some(Err(_)) | None => break,
                                }
                            }
                        }
                    }
                });
            }
        });

        Ok(Self {
            addr,
            connection_rx,
            server_task,
        })
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Await the next client connection.
    pub async fn accept_connection(&mut self) -> MockConnection {
        timeout(STEP_TIMEOUT, self.connection_rx.recv())
            .await
            .expect("timed out waiting for client connection")
            .expect("mock server connection channel closed")
    }

    pub async fn try_accept_connection(&mut self, wait: Duration) -> Option<MockConnection> {
        match timeout(wait, self.connection_rx.recv()).await {
            Ok(Some(connection)) => Some(connection),
            _ => None,
        }
    }
}

impl Drop for MockEventSubServer {
    fn drop(&mut self) {
        self.server_task.abort();
    }
}
