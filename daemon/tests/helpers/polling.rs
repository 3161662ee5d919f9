use agent_bridge_lib::bridge::protocol::{deserialize_event, BridgeEvent};
use futures_util::StreamExt;
use std::fmt;
use std::time::{Duration, Instant};
use tokio_tungstenite::tungstenite::Message;

use super::bridge_guard::PushClient;

/// Error returned when waiting for a push event times out.
#[derive(Debug)]
pub struct WaitError {
    waiting_for: String,
    waited: Duration,
    seen: Vec<&'static str>,
    last_error: Option<String>,
}

impl fmt::Display for WaitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Timed out after {:?} waiting for {}. Seen: [{}]. Last error: {}",
            self.waited,
            self.waiting_for,
            self.seen.join(", "),
            self.last_error.as_deref().unwrap_or("<none>")
        )
    }
}

impl std::error::Error for WaitError {}

/// Read events from a push client until `predicate` matches one.
///
/// Returns every event read, the matching one last.
pub async fn wait_for_event<F>(
    ws: &mut PushClient,
    waiting_for: &str,
    predicate: F,
    timeout: Duration,
) -> Result<Vec<BridgeEvent>, WaitError>
where
    F: Fn(&BridgeEvent) -> bool,
{
    let start = Instant::now();
    let read = read_events(ws, predicate, timeout).await;
    if read.matched {
        return Ok(read.events);
    }

    Err(WaitError {
        waiting_for: waiting_for.to_string(),
        waited: start.elapsed(),
        seen: read.events.iter().map(BridgeEvent::event_type).collect(),
        last_error: read.last_error,
    })
}

/// Read everything that arrives within `window`
pub async fn drain_events(ws: &mut PushClient, window: Duration) -> Vec<BridgeEvent> {
    read_events(ws, |_| false, window).await.events
}

struct ReadEvents {
    events: Vec<BridgeEvent>,
    matched: bool,
    last_error: Option<String>,
}

async fn read_events<F>(ws: &mut PushClient, predicate: F, timeout: Duration) -> ReadEvents
where
    F: Fn(&BridgeEvent) -> bool,
{
    let start = Instant::now();
    let mut read = ReadEvents {
        events: Vec::new(),
        matched: false,
        last_error: None,
    };

    loop {
        let remaining = timeout.saturating_sub(start.elapsed());
        if remaining.is_zero() {
            break;
        }

        match tokio::time::timeout(remaining, ws.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => match deserialize_event(&text) {
                Ok(event) => {
                    read.matched = predicate(&event);
                    read.events.push(event);
                    if read.matched {
                        break;
                    }
                }
                Err(e) => read.last_error = Some(format!("undecodable frame {:?}: {}", text, e)),
            },
            Ok(Some(Ok(_))) => {}
            Ok(Some(Err(e))) => {
                read.last_error = Some(e.to_string());
                break;
            }
            Ok(None) => {
                read.last_error = Some("stream closed".to_string());
                break;
            }
            // Timed out
            Err(_) => break,
        }
    }

    read
}
