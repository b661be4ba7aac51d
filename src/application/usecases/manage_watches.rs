use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::application::scheduler::SchedulerHandle;
use crate::application::{AppError, AppResult, SeenSet, WatchStore};
use crate::domain::{NewWatch, Platform, UserId, Watch};

/// The command surface: monitor / monitor-ending / list / stop.
///
/// Each command goes through the store first (durable), then tells the
/// scheduler so the change takes effect without waiting for a restart.
#[derive(Clone)]
pub struct WatchService {
    store: Arc<dyn WatchStore>,
    seen: Arc<dyn SeenSet>,
    scheduler: Option<SchedulerHandle>,
}

impl WatchService {
    pub fn new(store: Arc<dyn WatchStore>, seen: Arc<dyn SeenSet>) -> Self {
        Self {
            store,
            seen,
            scheduler: None,
        }
    }

    pub fn with_scheduler(mut self, handle: SchedulerHandle) -> Self {
        self.scheduler = Some(handle);
        self
    }

    pub async fn monitor(
        &self,
        user: UserId,
        platform: &str,
        query: &str,
        max_price: Option<f64>,
    ) -> AppResult<Watch> {
        let platform = parse_platform(platform)?;
        self.create(NewWatch::standard(user, platform, query, max_price))
            .await
    }

    /// `until` bounds the watch's life; once it passes the watch is dropped
    /// from scheduling and deactivated.
    pub async fn monitor_ending(
        &self,
        user: UserId,
        platform: &str,
        query: &str,
        max_price: Option<f64>,
        max_minutes: u32,
        until: Option<DateTime<Utc>>,
    ) -> AppResult<Watch> {
        let platform = parse_platform(platform)?;
        if until.is_some_and(|t| t <= Utc::now()) {
            return Err(AppError::Validation("expiry must be in the future".into()));
        }
        self.create(
            NewWatch::ending_soon(user, platform, query, max_price, max_minutes).with_expiry(until),
        )
        .await
    }

    pub async fn create(&self, new: NewWatch) -> AppResult<Watch> {
        let watch = self.store.create(new).await?;
        info!(
            watch_id = %watch.id,
            user = %watch.user,
            platform = %watch.platform,
            query = %watch.query,
            "watch created"
        );
        if let Some(scheduler) = &self.scheduler {
            scheduler.add(watch.clone());
        }
        Ok(watch)
    }

    pub async fn list(&self, user: UserId) -> AppResult<Vec<Watch>> {
        self.store.list(user).await
    }

    /// Stops the `position`-th watch as shown by `list` (1-based).
    pub async fn stop(&self, user: UserId, position: usize) -> AppResult<Watch> {
        let index = position
            .checked_sub(1)
            .ok_or_else(|| AppError::NotFound(format!("watch #{position} for user {user}")))?;
        let watch = self.store.deactivate(user, index).await?;
        if let Some(scheduler) = &self.scheduler {
            scheduler.remove(watch.id);
        }
        if let Err(e) = self.seen.forget(watch.id).await {
            warn!(watch_id = %watch.id, "failed to drop seen records: {e}");
        }
        info!(watch_id = %watch.id, user = %user, "watch stopped");
        Ok(watch)
    }

    /// Every active watch across users.
    pub async fn list_all(&self) -> AppResult<Vec<Watch>> {
        self.store.all_active().await
    }
}

fn parse_platform(s: &str) -> AppResult<Platform> {
    s.parse::<Platform>()
        .map_err(|e| AppError::Validation(e.to_string()))
}
