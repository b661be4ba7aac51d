use async_trait::async_trait;

use crate::application::{AppError, AppResult, NotificationSink};
use crate::domain::Notification;

/// Sends through every sink; one failing channel does not stop the others.
pub struct MultiNotifier {
    sinks: Vec<Box<dyn NotificationSink>>,
}

impl MultiNotifier {
    pub fn new(sinks: Vec<Box<dyn NotificationSink>>) -> Self {
        Self { sinks }
    }
}

#[async_trait]
impl NotificationSink for MultiNotifier {
    async fn send(&self, notification: &Notification) -> AppResult<()> {
        let mut last_err = None;

        for sink in &self.sinks {
            match sink.send(notification).await {
                Ok(()) => {}
                // a blocked destination outranks ordinary failures
                Err(e @ AppError::DestinationBlocked(_)) => return Err(e),
                Err(e) => last_err = Some(e),
            }
        }

        match last_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
