use async_trait::async_trait;

use crate::application::{AppResult, NotificationSink};
use crate::domain::Notification;

/// Prints notifications to stdout instead of delivering them.
pub struct ConsoleNotifier;

impl ConsoleNotifier {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ConsoleNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NotificationSink for ConsoleNotifier {
    async fn send(&self, notification: &Notification) -> AppResult<()> {
        println!(
            "NOTIFY: to={} image={}\n{}\n",
            notification.destination,
            notification.image_url.as_deref().unwrap_or("(none)"),
            notification.text
        );
        Ok(())
    }
}
