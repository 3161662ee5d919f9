use agent_bridge_lib::bridge::config::Config;
use agent_bridge_lib::bridge::server::Bridge;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

pub type PushClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

const SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Valid-looking extension origin (32 letters)
pub const EXTENSION_ORIGIN: &str = "chrome-extension://abcdefghijklmnopabcdefghijklmnop";

/// RAII wrapper around an in-process bridge bound to an ephemeral port.
/// The listener shuts down when the guard is dropped.
pub struct BridgeGuard {
    pub addr: SocketAddr,
    pub bridge: Bridge,
    shutdown_tx: Option<oneshot::Sender<()>>,
    server: Option<JoinHandle<anyhow::Result<()>>>,
}

impl BridgeGuard {
    /// Start a bridge configured from `vars` (as if they were environment variables)
    pub async fn start(vars: &[(&str, &str)]) -> Result<Self, GuardError> {
        let mut vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        vars.entry("AGENT_BRIDGE_GIT_BRANCH".to_string())
            .or_insert_with(|| "test-branch".to_string());
        vars.entry("AGENT_BRIDGE_STEP_DELAY_MS".to_string())
            .or_insert_with(|| "0".to_string());

        let config =
            Config::from_lookup(|key| vars.get(key).cloned()).map_err(|e| GuardError::Config(e.to_string()))?;

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(GuardError::Bind)?;
        let addr = listener.local_addr().map_err(GuardError::Bind)?;

        let bridge = Bridge::new(&config);
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let serving = bridge.clone();
        let server = tokio::spawn(async move {
            serving
                .serve(listener, async {
                    let _ = shutdown_rx.await;
                })
                .await
        });

        Ok(Self {
            addr,
            bridge,
            shutdown_tx: Some(shutdown_tx),
            server: Some(server),
        })
    }

    /// Send one HTTP request and return the status code and decoded JSON body
    /// (`Value::Null` for an empty body)
    pub async fn request(
        &self,
        method: &str,
        path: &str,
        body: Option<&Value>,
        authorization: Option<&str>,
    ) -> (u16, Value) {
        let payload = body.map(Value::to_string).unwrap_or_default();
        let mut raw = format!(
            "{} {} HTTP/1.1\r\nHost: {}\r\nContent-Length: {}\r\n",
            method,
            path,
            self.addr,
            payload.len()
        );
        if body.is_some() {
            raw.push_str("Content-Type: application/json\r\n");
        }
        if let Some(auth) = authorization {
            raw.push_str(&format!("Authorization: {}\r\n", auth));
        }
        raw.push_str("\r\n");
        raw.push_str(&payload);

        self.send_raw(raw.as_bytes()).await
    }

    pub async fn get(&self, path: &str) -> (u16, Value) {
        self.request("GET", path, None, None).await
    }

    pub async fn post(&self, path: &str, body: Value) -> (u16, Value) {
        self.request("POST", path, Some(&body), None).await
    }

    /// Write raw bytes and parse whatever comes back
    pub async fn send_raw(&self, raw: &[u8]) -> (u16, Value) {
        let mut stream = TcpStream::connect(self.addr)
            .await
            .expect("Failed to connect to bridge");
        stream.write_all(raw).await.expect("Failed to write request");

        let mut response = Vec::new();
        stream
            .read_to_end(&mut response)
            .await
            .expect("Failed to read response");
        let response = String::from_utf8_lossy(&response);

        let status = response
            .split_whitespace()
            .nth(1)
            .and_then(|s| s.parse().ok())
            .unwrap_or_else(|| panic!("Malformed response: {:?}", response));
        let body = response.split_once("\r\n\r\n").map(|(_, b)| b).unwrap_or("");
        let body = if body.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(body).unwrap_or_else(|e| panic!("Bad JSON {:?}: {}", body, e))
        };
        (status, body)
    }

    /// Open a push-channel connection with extra handshake headers.
    /// Waits until the server has subscribed the client to the event stream.
    pub async fn connect_push(
        &self,
        path: &str,
        headers: &[(&'static str, &str)],
    ) -> Result<PushClient, tokio_tungstenite::tungstenite::Error> {
        let expected = self.bridge.events.receiver_count() + 1;

        let mut request = format!("ws://{}{}", self.addr, path).into_client_request()?;
        for (name, value) in headers {
            request.headers_mut().insert(
                *name,
                HeaderValue::from_str(value).expect("invalid header value"),
            );
        }
        let (ws, _response) = connect_async(request).await?;

        self.wait_for_subscribers(expected).await;
        Ok(ws)
    }

    /// Open a push-channel connection as the browser extension
    pub async fn connect_extension(&self) -> PushClient {
        self.connect_push("/", &[("Origin", EXTENSION_ORIGIN)])
            .await
            .expect("extension handshake should succeed")
    }

    pub async fn wait_for_subscribers(&self, count: usize) {
        let start = Instant::now();
        while self.bridge.events.receiver_count() < count {
            assert!(
                start.elapsed() < SUBSCRIBE_TIMEOUT,
                "Timed out waiting for {} push subscribers",
                count
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

impl Drop for BridgeGuard {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(server) = self.server.take() {
            // Connections already spawned may outlive the listener
            server.abort();
        }
    }
}

/// Errors that can occur when starting a bridge for tests.
#[derive(Debug)]
pub enum GuardError {
    Config(String),
    Bind(std::io::Error),
}

impl fmt::Display for GuardError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(err) => write!(f, "invalid test configuration: {}", err),
            Self::Bind(err) => write!(f, "failed to bind test listener: {}", err),
        }
    }
}

impl std::error::Error for GuardError {}
