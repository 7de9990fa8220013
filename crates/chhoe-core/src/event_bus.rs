use tokio::sync::broadcast;

use chhoe_types::SearchEvent;

/// Fan-out channel for outward search effects. Subscribers that lag far
/// enough to overflow the buffer miss events rather than blocking the
/// controller.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SearchEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(2048);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SearchEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: SearchEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
