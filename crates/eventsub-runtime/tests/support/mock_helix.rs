#![allow(dead_code)]

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// One parsed HTTP request as seen by the mock.
#[derive(Debug, Clone)]
pub struct MockRequest {
    pub method: String,
    /// Path without the query string.
    pub path: String,
    /// Raw query string ("" when absent).
    pub query: String,
    pub body: String,
}

impl MockRequest {
    pub fn json_body(&self) -> Option<Value> {
        serde_json::from_str(&self.body).ok()
    }
}

/// Scripted HTTP response.
#[derive(Debug, Clone)]
pub struct MockResponse {
    pub status: u16,
    pub body: String,
    pub headers: Vec<(String, String)>,
}

impl MockResponse {
    pub fn json(status: u16, value: &Value) -> Self {
        Self {
            status,
            body: value.to_string(),
            headers: vec![("content-type".into(), "application/json".into())],
        }
    }

    pub fn empty(status: u16) -> Self {
        Self {
            status,
            body: String::new(),
            headers: Vec::new(),
        }
    }
}

pub type Handler = Arc<dyn Fn(&MockRequest) -> MockResponse + Send + Sync>;

/// Minimal scripted HTTP/1.1 server for the Helix and OAuth endpoints.
/// Routes every request through a single handler closure and records all
/// requests in arrival order.
pub struct MockHelixServer {
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<MockRequest>>>,
    server_task: JoinHandle<()>,
}

impl MockHelixServer {
    pub async fn start<H>(handler: H) -> std::io::Result<Self>
    where
        H: Fn(&MockRequest) -> MockResponse + Send + Sync + 'static,
    {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let addr = listener.local_addr()?;
        let requests: Arc<Mutex<Vec<MockRequest>>> = Arc::new(Mutex::new(Vec::new()));
        let handler: Handler = Arc::new(handler);

        let server_task = {
            let requests = Arc::clone(&requests);
            tokio::spawn(async move {
                loop {
                    let (stream, _) = match listener.accept().await {
                        Ok(pair) => pair,
                        Err(_) => break,
                    };
                    let requests = Arc::clone(&requests);
                    let handler = Arc::clone(&handler);
                    tokio::spawn(async move {
                        let _ = serve_connection(stream, requests, handler).await;
                    });
                }
            })
        };

        Ok(Self {
            addr,
            requests,
            server_task,
        })
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Snapshot of every request received so far.
    pub async fn requests(&self) -> Vec<MockRequest> {
        self.requests.lock().await.clone()
    }

    /// Count of requests matching a method + path prefix.
    pub async fn count_requests(&self, method: &str, path: &str) -> usize {
        self.requests
            .lock()
            .await
            .iter()
            .filter(|r| r.method == method && r.path == path)
            .count()
    }
}

impl Drop for MockHelixServer {
    fn drop(&mut self) {
        self.server_task.abort();
    }
}

async fn serve_connection(
    stream: TcpStream,
    requests: Arc<Mutex<Vec<MockRequest>>>,
    handler: Handler,
) -> std::io::Result<()> {
    let mut reader = BufReader::new(stream);

    loop {
        let mut request_line = String::new();
        if reader.read_line(&mut request_line).await? == 0 {
            return Ok(()); // client closed
        }
        let mut parts = request_line.split_whitespace();
        let method = parts.next().unwrap_or_default().to_string();
        let target = parts.next().unwrap_or_default().to_string();
        let (path, query) = match target.split_once('?') {
            Some((p, q)) => (p.to_string(), q.to_string()),
            None => (target.clone(), String::new()),
        };

        let mut content_length = 0usize;
        loop {
            let mut line = String::new();
            if reader.read_line(&mut line).await? == 0 {
                return Ok(());
            }
            let line = line.trim();
            if line.is_empty() {
                break;
            }
            if let Some((name, value)) = line.split_once(':') {
                if name.eq_ignore_ascii_case("content-length") {
                    content_length = value.trim().parse().unwrap_or(0);
                }
            }
        }

        let mut body_bytes = vec![0u8; content_length];
        if content_length > 0 {
            reader.read_exact(&mut body_bytes).await?;
        }
        let request = MockRequest {
            method,
            path,
            query,
            body: String::from_utf8_lossy(&body_bytes).into_owned(),
        };

        let response = handler(&request);
        requests.lock().await.push(request);

        let mut head = format!("HTTP/1.1 {} Mock\r\n", response.status);
        for (name, value) in &response.headers {
            head.push_str(&format!("{name}: {value}\r\n"));
        }
        // 204 must not carry a body.
        if response.status != 204 && response.status != 304 {
            head.push_str(&format!("content-length: {}\r\n", response.body.len()));
        }
        head.push_str("\r\n");

        let stream = reader.get_mut();
        stream.write_all(head.as_bytes()).await?;
        if response.status != 204 && response.status != 304 {
            stream.write_all(response.body.as_bytes()).await?;
        }
        stream.flush().await?;
    }
}
