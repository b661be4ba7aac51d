use async_trait::async_trait;

use crate::application::{AppResult, EventPublisher};
use crate::domain::NotificationEvent;
use crate::infrastructure::event_bus::EventBus;

pub struct BroadcastPublisher {
    bus: EventBus,
}

impl BroadcastPublisher {
    pub fn new(bus: EventBus) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl EventPublisher for BroadcastPublisher {
    async fn publish(&self, event: &NotificationEvent) -> AppResult<()> {
        self.bus.publish(event.clone());
        Ok(())
    }
}
