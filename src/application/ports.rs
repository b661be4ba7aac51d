use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{
    Listing, NewWatch, Notification, NotificationEvent, Platform, SortOrder, UserId, Watch,
    WatchId, WatchValidationError,
};

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("watch limit reached: at most {limit} active watches per user")]
    QuotaExceeded { limit: usize },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("fetch error: {0}")]
    Fetch(String),
    #[error("rate limited by upstream: {0}")]
    RateLimited(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("notifier error: {0}")]
    Notification(String),
    #[error("destination {0} blocked the bot")]
    DestinationBlocked(UserId),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("invalid config: {0}")]
    Config(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Source failures that should push the watch into backoff instead of surfacing.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AppError::Fetch(_) | AppError::RateLimited(_) | AppError::Parse(_)
        )
    }

    /// Errors caused by the caller's input; reported back verbatim.
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            AppError::Validation(_) | AppError::QuotaExceeded { .. } | AppError::NotFound(_)
        )
    }
}

impl From<WatchValidationError> for AppError {
    fn from(e: WatchValidationError) -> Self {
        AppError::Validation(e.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;

/// Durable owner of watch lifecycle. Mutations are persisted before returning.
#[async_trait]
pub trait WatchStore: Send + Sync {
    /// Fails with `Validation` on bad input, `QuotaExceeded` when the user is at the cap.
    async fn create(&self, new: NewWatch) -> AppResult<Watch>;
    /// Active watches of `user`, oldest first.
    async fn list(&self, user: UserId) -> AppResult<Vec<Watch>>;
    /// Deactivates the `index`-th (0-based) entry of `list(user)`.
    async fn deactivate(&self, user: UserId, index: usize) -> AppResult<Watch>;
    /// Deactivates by id; `Ok(false)` if it was already inactive or unknown.
    async fn deactivate_by_id(&self, id: WatchId) -> AppResult<bool>;
    async fn get(&self, id: WatchId) -> AppResult<Option<Watch>>;
    async fn all_active(&self) -> AppResult<Vec<Watch>>;
}

/// Per-watch record of listings already notified.
#[async_trait]
pub trait SeenSet: Send + Sync {
    async fn has_seen(&self, watch: WatchId, listing_id: &str) -> AppResult<bool>;
    async fn mark_seen(&self, watch: WatchId, listing_id: &str, at: DateTime<Utc>) -> AppResult<()>;
    async fn evict_older_than(&self, watch: WatchId, cutoff: DateTime<Utc>) -> AppResult<u64>;
    /// Keeps only the `keep` most recent records of `watch`.
    async fn evict_over_capacity(&self, watch: WatchId, keep: usize) -> AppResult<u64>;
    /// Drops every record of `watch`.
    async fn forget(&self, watch: WatchId) -> AppResult<()>;
}

/// Marketplace search. Errors: `Fetch`, `Parse`, `RateLimited`.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    async fn fetch(&self, platform: Platform, query: &str, sort: SortOrder)
        -> AppResult<Vec<Listing>>;
}

/// Deliver notifications. `DestinationBlocked` means the user can no longer be reached.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn send(&self, notification: &Notification) -> AppResult<()>;
}

#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: &NotificationEvent) -> AppResult<()>;
}
