//! Raw WebSocket connection establishment for EventSub.

use std::time::Duration;

use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio::sync::RwLock;

use crate::error::{RuntimeError, RuntimeResult};

/// Subprotocol required by the EventSub WebSocket endpoint.
pub(crate) const EVENTSUB_SUBPROTOCOL: &str = "twitch-eventsub-ws";

/// Timeout for the initial WebSocket handshake.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens sockets to the current EventSub URL with auth headers attached.
///
/// The URL is interior-mutable because the server can direct the session to
/// a replacement URL mid-flight; the token is interior-mutable because the
/// token manager rotates it underneath the session.
pub(crate) struct WsConnector {
    url: RwLock<String>,
    token: RwLock<String>,
    client_id: String,
}

impl WsConnector {
    pub(crate) fn new(
        url: impl Into<String>,
        token: impl Into<String>,
        client_id: impl Into<String>,
    ) -> Self {
        Self {
            url: RwLock::new(url.into()),
            token: RwLock::new(token.into()),
            client_id: client_id.into(),
        }
    }

    pub(crate) async fn url(&self) -> String {
        self.url.read().await.clone()
    }

    pub(crate) async fn update_url(&self, new_url: &str) {
        let mut url = self.url.write().await;
        if !new_url.is_empty() && new_url != url.as_str() {
            *url = new_url.to_string();
        }
    }

    pub(crate) async fn update_token(&self, new_token: &str) {
        *self.token.write().await = new_token.to_string();
    }

    /// Open a socket to the current URL.
    ///
    /// # Errors
    /// `Connection { connect }` on handshake failure, `Timeout` when the
    /// handshake does not complete in time.
    pub(crate) async fn connect(&self) -> RuntimeResult<WsStream> {
        let url = self.url().await;
        let token = self.token.read().await.clone();

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| RuntimeError::connection("connect", format!("invalid URL '{url}': {e}")))?;
        let headers = request.headers_mut();
        headers.insert(
            "Client-Id",
            self.client_id
                .parse()
                .map_err(|e| RuntimeError::connection("connect", format!("bad client id: {e}")))?,
        );
        headers.insert(
            "Authorization",
            format!("Bearer {token}")
                .parse()
                .map_err(|e| RuntimeError::connection("connect", format!("bad token header: {e}")))?,
        );
        headers.insert(
            "Sec-WebSocket-Protocol",
            EVENTSUB_SUBPROTOCOL.parse().expect("static header value"),
        );

        let (ws, response) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(request))
            .await
            .map_err(|_| RuntimeError::Timeout {
                operation: "connect".into(),
                seconds: CONNECT_TIMEOUT.as_secs(),
            })?
            .map_err(|e| RuntimeError::connection("connect", e))?;

        tracing::info!(url = %url, status = %response.status(), "WebSocket connected");
        Ok(ws)
    }
}
