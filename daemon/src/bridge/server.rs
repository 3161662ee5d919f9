// TCP front door: one listener for both plain HTTP and the WebSocket push channel
// Each connection is peeked, then handed to the HTTP handler or the push channel

use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::api::BridgeState;
use super::config::Config;
use super::coordinator::TaskCoordinator;
use super::http::{is_websocket_upgrade, peek_head, serve_http};
use super::protocol::BridgeEvent;
use super::push::serve_push;
use super::runner::SimulatedWork;

/// Buffered events per push client before it starts lagging
pub const EVENT_CHANNEL_CAPACITY: usize = 100;

/// Everything a running bridge needs, wired together
#[derive(Clone)]
pub struct Bridge {
    pub state: Arc<BridgeState>,
    pub events: broadcast::Sender<BridgeEvent>,
}

impl Bridge {
    /// Coordinator broadcasting into a fresh event channel, with the simulated
    /// runner paced by `config.step_delay`
    pub fn new(config: &Config) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let coordinator = Arc::new(TaskCoordinator::new(
            Arc::new(events.clone()),
            Arc::new(SimulatedWork::new(config.step_delay)),
        ));

        Self {
            state: Arc::new(BridgeState::new(coordinator, config)),
            events,
        }
    }

    /// Accept connections until `shutdown` resolves
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            debug!(%addr, "accepted connection");
                            let bridge = self.clone();
                            tokio::spawn(async move {
                                if let Err(e) = bridge.handle_connection(stream).await {
                                    warn!(error = %e, "connection error");
                                }
                            });
                        }
                        Err(e) => {
                            warn!(error = %e, "accept error");
                        }
                    }
                }

                _ = &mut shutdown => {
                    info!("shutting down listener");
                    break;
                }
            }
        }

        Ok(())
    }

    async fn handle_connection(&self, stream: TcpStream) -> Result<()> {
        let head = peek_head(&stream).await?;
        if head.is_empty() {
            return Ok(());
        }

        if is_websocket_upgrade(&head) {
            serve_push(stream, &self.state, &self.events).await
        } else {
            serve_http(stream, &self.state).await?;
            Ok(())
        }
    }
}
