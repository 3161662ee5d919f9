// Minimal HTTP/1.1 framing for the front door
// One request per connection: parse head + Content-Length body, answer, close

use std::time::Duration;

use serde_json::{json, Value};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::debug;

use super::api::{self, ApiRequest, BridgeState};

/// Maximum size of the request line plus headers (16KB)
pub const MAX_HEAD_SIZE: usize = 16 * 1024;

/// Maximum request body size (1MB)
pub const MAX_BODY_SIZE: usize = 1024 * 1024;

/// How many times to peek for a complete head before routing on what arrived
const PEEK_ATTEMPTS: usize = 40;
const PEEK_INTERVAL: Duration = Duration::from_millis(5);

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("connection closed before the request was complete")]
    Incomplete,

    #[error("request head exceeds {max} bytes")]
    HeadTooLarge { max: usize },

    #[error("request body of {size} bytes exceeds limit of {max}")]
    BodyTooLarge { size: usize, max: usize },

    #[error("malformed request: {0}")]
    Malformed(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A parsed request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: String,
    pub target: String,
    /// Header names are lowercased
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Request {
    /// First value of a header, case-insensitive
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Read one request from `reader`
pub async fn read_request<R>(reader: &mut R) -> Result<Request, HttpError>
where
    R: AsyncBufRead + Unpin,
{
    let mut head = (&mut *reader).take(MAX_HEAD_SIZE as u64);
    let mut consumed = 0usize;
    let mut line = String::new();

    let request_line = loop {
        line.clear();
        let n = head.read_line(&mut line).await?;
        consumed += n;
        if n == 0 {
            return Err(head_exhausted(consumed));
        }
        // Tolerate stray CRLFs before the request line
        if !line.trim().is_empty() {
            break line.trim_end().to_string();
        }
    };

    let mut parts = request_line.split_whitespace();
    let (method, target, version) = match (parts.next(), parts.next(), parts.next()) {
        (Some(m), Some(t), Some(v)) => (m.to_string(), t.to_string(), v),
        _ => return Err(HttpError::Malformed(format!("bad request line: {}", request_line))),
    };
    if !version.starts_with("HTTP/1.") {
        return Err(HttpError::Malformed(format!("unsupported version: {}", version)));
    }

    let mut headers = Vec::new();
    loop {
        line.clear();
        let n = head.read_line(&mut line).await?;
        consumed += n;
        if n == 0 {
            return Err(head_exhausted(consumed));
        }
        let trimmed = line.trim_end();
        if trimmed.is_empty() {
            break;
        }
        let (name, value) = trimmed
            .split_once(':')
            .ok_or_else(|| HttpError::Malformed(format!("bad header line: {}", trimmed)))?;
        headers.push((name.trim().to_ascii_lowercase(), value.trim().to_string()));
    }

    let mut request = Request {
        method,
        target,
        headers,
        body: Vec::new(),
    };

    if request.header("transfer-encoding").is_some() {
        return Err(HttpError::Malformed(
            "chunked request bodies are not supported".to_string(),
        ));
    }

    let length = match request.header("content-length") {
        Some(raw) => raw
            .parse::<usize>()
            .map_err(|_| HttpError::Malformed(format!("bad content-length: {}", raw)))?,
        None => 0,
    };
    if length > MAX_BODY_SIZE {
        return Err(HttpError::BodyTooLarge {
            size: length,
            max: MAX_BODY_SIZE,
        });
    }

    let mut body = vec![0u8; length];
    reader.read_exact(&mut body).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            HttpError::Incomplete
        } else {
            HttpError::Io(e)
        }
    })?;
    request.body = body;

    Ok(request)
}

fn head_exhausted(consumed: usize) -> HttpError {
    if consumed >= MAX_HEAD_SIZE {
        HttpError::HeadTooLarge { max: MAX_HEAD_SIZE }
    } else {
        HttpError::Incomplete
    }
}

pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        204 => "No Content",
        400 => "Bad Request",
        401 => "Unauthorized",
        404 => "Not Found",
        409 => "Conflict",
        413 => "Payload Too Large",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        _ => "Unknown",
    }
}

/// Write a complete response. `None` sends no body (preflight).
pub async fn write_response<W>(writer: &mut W, status: u16, body: Option<&Value>) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let payload = match body {
        Some(value) => serde_json::to_vec(value)?,
        None => Vec::new(),
    };

    let mut head = format!("HTTP/1.1 {} {}\r\n", status, reason_phrase(status));
    if body.is_some() {
        head.push_str("Content-Type: application/json\r\n");
    }
    head.push_str(&format!("Content-Length: {}\r\n", payload.len()));
    head.push_str("Access-Control-Allow-Origin: *\r\n");
    head.push_str("Access-Control-Allow-Methods: GET, POST, OPTIONS\r\n");
    head.push_str("Access-Control-Allow-Headers: Content-Type, Authorization\r\n");
    head.push_str("Connection: close\r\n\r\n");

    writer.write_all(head.as_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await
}

/// Answer a single request read from `stream`
pub async fn serve_http<S>(stream: S, state: &BridgeState) -> Result<(), HttpError>
where
    S: tokio::io::AsyncRead + AsyncWrite + Unpin,
{
    let mut reader = BufReader::new(stream);

    let request = match read_request(&mut reader).await {
        Ok(request) => request,
        Err(HttpError::Incomplete) => {
            debug!("client hung up mid-request");
            return Ok(());
        }
        Err(HttpError::Io(e)) => return Err(HttpError::Io(e)),
        Err(e) => {
            let status = match e {
                HttpError::BodyTooLarge { .. } => 413,
                HttpError::HeadTooLarge { .. } => 431,
                _ => 400,
            };
            debug!(status, error = %e, "rejecting request");
            let body = json!({ "ok": false, "error": e.to_string() });
            write_response(reader.get_mut(), status, Some(&body)).await?;
            return Ok(());
        }
    };

    if request.method == "OPTIONS" {
        write_response(reader.get_mut(), 204, None).await?;
        return Ok(());
    }

    let response = api::handle(
        state,
        ApiRequest {
            method: &request.method,
            path: &request.target,
            authorization: request.header("authorization"),
            body: &request.body,
        },
    )
    .await;
    debug!(
        method = %request.method,
        target = %request.target,
        status = response.status,
        "handled request"
    );

    write_response(reader.get_mut(), response.status, Some(&response.body)).await?;
    Ok(())
}

/// Whether a request head asks for a WebSocket upgrade
pub fn is_websocket_upgrade(head: &[u8]) -> bool {
    let head = String::from_utf8_lossy(head);
    head.split("\r\n").skip(1).any(|line| {
        line.split_once(':').is_some_and(|(name, value)| {
            name.trim().eq_ignore_ascii_case("upgrade")
                && value
                    .split(',')
                    .any(|token| token.trim().eq_ignore_ascii_case("websocket"))
        })
    })
}

/// Peek at the request head without consuming it, so the connection can
/// still be handed to either the HTTP or the WebSocket side
pub async fn peek_head(stream: &TcpStream) -> std::io::Result<Vec<u8>> {
    let mut buf = vec![0u8; MAX_HEAD_SIZE];
    let mut seen = 0;

    for _ in 0..PEEK_ATTEMPTS {
        seen = stream.peek(&mut buf).await?;
        if seen == 0 || seen == buf.len() || contains_head_end(&buf[..seen]) {
            break;
        }
        tokio::time::sleep(PEEK_INTERVAL).await;
    }

    buf.truncate(seen);
    Ok(buf)
}

fn contains_head_end(bytes: &[u8]) -> bool {
    bytes.windows(4).any(|w| w == b"\r\n\r\n")
}
