//! WebSocket push channel.
//!
//! The handshake is authorized with [`verify`] before the upgrade completes;
//! a refused client gets a bare `401` and never sees an event. Accepted
//! clients receive every [`BridgeEvent`] as a JSON text frame. Anything the
//! client sends is ignored apart from close frames (pings are answered by the
//! WebSocket layer).

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, info, warn};

use super::api::BridgeState;
use super::auth::{verify, ConnectionInfo};
use super::protocol::{serialize_event, BridgeEvent};

/// Pull the fields [`verify`] looks at out of a handshake request
pub fn connection_info(request: &Request) -> ConnectionInfo {
    let header = |name: &str| {
        request
            .headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };

    ConnectionInfo {
        origin: header("origin"),
        url: Some(request.uri().to_string()),
        host: header("host"),
        authorization: header("authorization"),
    }
}

fn unauthorized() -> ErrorResponse {
    let mut response = ErrorResponse::new(None);
    *response.status_mut() = StatusCode::UNAUTHORIZED;
    response
}

/// Run one push-channel client until it disconnects or the event stream ends
pub async fn serve_push<S>(
    stream: S,
    state: &BridgeState,
    events: &broadcast::Sender<BridgeEvent>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let shared_secret = state.shared_secret.as_deref();
    let allowed_extension_id = state.allowed_extension_id.as_deref();

    let authorize = |request: &Request, response: Response| {
        let info = connection_info(request);
        if verify(&info, shared_secret, allowed_extension_id) {
            debug!(origin = ?info.origin, "push client authorized");
            Ok(response)
        } else {
            warn!(origin = ?info.origin, host = ?info.host, "push client rejected");
            Err(unauthorized())
        }
    };

    let ws = match accept_hdr_async(stream, authorize).await {
        Ok(ws) => ws,
        // The 401 has already been written
        Err(WsError::Http(_)) => return Ok(()),
        Err(e) => {
            debug!(error = %e, "push handshake failed");
            return Ok(());
        }
    };

    // Subscribe only once accepted
    let mut updates_rx = events.subscribe();
    let (mut sink, mut incoming) = ws.split();
    info!(subscribers = events.receiver_count(), "push client connected");

    loop {
        tokio::select! {
            result = updates_rx.recv() => {
                match result {
                    Ok(event) => {
                        let text = serialize_event(&event)?;
                        if sink.send(Message::Text(text)).await.is_err() {
                            break; // Client disconnected
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        // Client is too slow, skip missed events
                        debug!(skipped, "push client lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        break;
                    }
                }
            }

            message = incoming.next() => {
                match message {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Ping(_))) => {
                        // Flush the pong queued by the protocol layer
                        if sink.flush().await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(error = %e, "push client read error");
                        break;
                    }
                }
            }
        }
    }

    let _ = sink.close().await;
    info!("push client disconnected");
    Ok(())
}
