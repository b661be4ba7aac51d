use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::debug;

use crate::application::{AppError, AppResult, SourceAdapter};
use crate::domain::{FetchKey, Listing, Platform, SortOrder};

type Entry = Arc<tokio::sync::Mutex<Option<(Instant, Vec<Listing>)>>>;

/// Shares one upstream request between identical searches.
///
/// Fetches for the same `(platform, query, sort)` within `ttl` reuse the last
/// successful result; concurrent ones wait on the fetch already running.
/// Failures are never cached.
pub struct CoalescingSource<S> {
    inner: S,
    ttl: Duration,
    entries: Mutex<HashMap<FetchKey, Entry>>,
}

impl<S: SourceAdapter> CoalescingSource<S> {
    pub fn new(inner: S, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn entry(&self, key: &FetchKey) -> AppResult<Entry> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| AppError::Internal("lock poisoned".into()))?;
        let now = Instant::now();
        // drop stale entries nobody is waiting on
        entries.retain(|_, e| {
            Arc::strong_count(e) > 1
                || e.try_lock()
                    .map(|g| g.as_ref().is_some_and(|(at, _)| now.duration_since(*at) < self.ttl))
                    .unwrap_or(true)
        });
        Ok(Arc::clone(entries.entry(key.clone()).or_default()))
    }
}

#[async_trait]
impl<S: SourceAdapter> SourceAdapter for CoalescingSource<S> {
    async fn fetch(&self, platform: Platform, query: &str, sort: SortOrder) -> AppResult<Vec<Listing>> {
        if self.ttl.is_zero() {
            return self.inner.fetch(platform, query, sort).await;
        }
        let key = FetchKey {
            platform,
            query: query.to_string(),
            sort,
        };
        let entry = self.entry(&key)?;
        let mut slot = entry.lock().await;
        if let Some((at, listings)) = slot.as_ref() {
            if at.elapsed() < self.ttl {
                debug!(platform = %platform, query, "serving search from cache");
                return Ok(listings.clone());
            }
        }
        let listings = self.inner.fetch(platform, query, sort).await?;
        *slot = Some((Instant::now(), listings.clone()));
        Ok(listings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::fake_source::FakeSource;

    #[tokio::test(start_paused = true)]
    async fn identical_fetches_share_one_request_within_ttl() {
        let fake = FakeSource::new();
        fake.set_listings(Platform::Mercari, "switch", vec![FakeSource::listing("a", 1.0)]);
        let source = CoalescingSource::new(fake.clone(), Duration::from_secs(60));

        for _ in 0..3 {
            let got = source
                .fetch(Platform::Mercari, "switch", SortOrder::Newest)
                .await
                .unwrap();
            assert_eq!(got.len(), 1);
        }
        assert_eq!(fake.calls(), 1);

        // different sort is a different request
        source
            .fetch(Platform::Mercari, "switch", SortOrder::PriceAsc)
            .await
            .unwrap();
        assert_eq!(fake.calls(), 2);

        tokio::time::advance(Duration::from_secs(61)).await;
        source
            .fetch(Platform::Mercari, "switch", SortOrder::Newest)
            .await
            .unwrap();
        assert_eq!(fake.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_fetches_wait_for_the_running_one() {
        let fake = FakeSource::new();
        fake.set_delay(Duration::from_secs(2));
        let source = Arc::new(CoalescingSource::new(fake.clone(), Duration::from_secs(60)));

        let a = tokio::spawn({
            let s = Arc::clone(&source);
            async move { s.fetch(Platform::Yahoo, "q", SortOrder::Newest).await }
        });
        let b = tokio::spawn({
            let s = Arc::clone(&source);
            async move { s.fetch(Platform::Yahoo, "q", SortOrder::Newest).await }
        });
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();
        assert_eq!(fake.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_are_not_cached() {
        let fake = FakeSource::new();
        fake.push_failure(Platform::Yahoo, "q", AppError::Fetch("boom".into()));
        let source = CoalescingSource::new(fake.clone(), Duration::from_secs(60));

        assert!(source.fetch(Platform::Yahoo, "q", SortOrder::Newest).await.is_err());
        assert!(source.fetch(Platform::Yahoo, "q", SortOrder::Newest).await.is_ok());
        assert_eq!(fake.calls(), 2);
    }
}
