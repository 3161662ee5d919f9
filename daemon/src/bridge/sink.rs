// Event broadcast capability injected into the coordinator
// The push channel subscribes to the same tokio broadcast channel the daemon hands in here

use tokio::sync::broadcast;

use super::protocol::BridgeEvent;

/// Anything that can fan a lifecycle event out to connected clients
pub trait EventSink: Send + Sync {
    fn broadcast(&self, event: BridgeEvent);
}

impl EventSink for broadcast::Sender<BridgeEvent> {
    fn broadcast(&self, event: BridgeEvent) {
        // Ignore send errors (no subscribers)
        let _ = self.send(event);
    }
}
