use tokio::sync::broadcast;

use crate::domain::NotificationEvent;

/// In-process fan-out of delivered notifications.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<NotificationEvent>,
}

impl EventBus {
    pub fn new(buffer: usize) -> Self {
        let (tx, _) = broadcast::channel(buffer.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NotificationEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: NotificationEvent) {
        // no subscribers is fine; slow subscribers see Lagged
        let _ = self.tx.send(event);
    }
}
