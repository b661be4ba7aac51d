#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use zenwatch::application::usecases::{DispatchConfig, Dispatcher};
use zenwatch::application::{AppError, AppResult, NotificationSink, SeenSet};
use zenwatch::domain::{Notification, UserId};
use zenwatch::infrastructure::fake_source::FakeSource;

/// Records every notification; can be told to fail or to report a blocked destination.
#[derive(Clone, Default)]
pub struct RecordingSink {
    sent: Arc<Mutex<Vec<Notification>>>,
    failures_left: Arc<Mutex<HashMap<UserId, u32>>>,
    blocked: Arc<Mutex<HashSet<UserId>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    pub fn count_for(&self, user: UserId) -> usize {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|n| n.destination == user)
            .count()
    }

    /// The next `n` sends to `user` fail with a notification error.
    pub fn fail_next(&self, user: UserId, n: u32) {
        self.failures_left.lock().unwrap().insert(user, n);
    }

    pub fn block(&self, user: UserId) {
        self.blocked.lock().unwrap().insert(user);
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn send(&self, notification: &Notification) -> AppResult<()> {
        let user = notification.destination;
        if self.blocked.lock().unwrap().contains(&user) {
            return Err(AppError::DestinationBlocked(user));
        }
        if let Some(left) = self.failures_left.lock().unwrap().get_mut(&user) {
            if *left > 0 {
                *left -= 1;
                return Err(AppError::Notification("sink unavailable".into()));
            }
        }
        self.sent.lock().unwrap().push(notification.clone());
        Ok(())
    }
}

pub fn quick_dispatch() -> DispatchConfig {
    DispatchConfig {
        send_spacing: Duration::ZERO,
        ..DispatchConfig::default()
    }
}

pub fn dispatcher(
    source: &FakeSource,
    seen: Arc<dyn SeenSet>,
    sink: &RecordingSink,
    config: DispatchConfig,
) -> Dispatcher {
    Dispatcher::new(
        Arc::new(source.clone()),
        seen,
        Arc::new(sink.clone()),
        config,
    )
}
