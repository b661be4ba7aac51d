use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::application::{AppError, AppResult, SeenSet, WatchStore};
use crate::domain::{NewWatch, UserId, Watch, WatchId};

fn lock<T>(m: &Mutex<T>) -> AppResult<MutexGuard<'_, T>> {
    m.lock()
        .map_err(|_| AppError::Storage("lock poisoned".into()))
}

#[derive(Clone)]
pub struct InMemoryWatchStore {
    inner: Arc<Mutex<WatchInner>>,
    max_active_per_user: usize,
}

#[derive(Default)]
struct WatchInner {
    next_id: u64,
    // insertion order == creation order
    watches: Vec<Watch>,
}

impl InMemoryWatchStore {
    pub fn new(max_active_per_user: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(WatchInner::default())),
            max_active_per_user,
        }
    }
}

impl WatchInner {
    fn active_for(&self, user: UserId) -> impl Iterator<Item = &Watch> {
        self.watches
            .iter()
            .filter(move |w| w.active && w.user == user)
    }
}

#[async_trait]
impl WatchStore for InMemoryWatchStore {
    async fn create(&self, new: NewWatch) -> AppResult<Watch> {
        new.validate()?;
        let mut inner = lock(&self.inner)?;
        if inner.active_for(new.user).count() >= self.max_active_per_user {
            return Err(AppError::QuotaExceeded {
                limit: self.max_active_per_user,
            });
        }
        inner.next_id += 1;
        let watch = new.into_watch(WatchId(inner.next_id), Utc::now());
        inner.watches.push(watch.clone());
        Ok(watch)
    }

    async fn list(&self, user: UserId) -> AppResult<Vec<Watch>> {
        let inner = lock(&self.inner)?;
        Ok(inner.active_for(user).cloned().collect())
    }

    async fn deactivate(&self, user: UserId, index: usize) -> AppResult<Watch> {
        let mut inner = lock(&self.inner)?;
        let id = inner
            .active_for(user)
            .nth(index)
            .map(|w| w.id)
            .ok_or_else(|| AppError::NotFound(format!("watch #{} for user {user}", index + 1)))?;
        let watch = inner
            .watches
            .iter_mut()
            .find(|w| w.id == id)
            .ok_or_else(|| AppError::NotFound(format!("watch {id}")))?;
        watch.active = false;
        Ok(watch.clone())
    }

    async fn deactivate_by_id(&self, id: WatchId) -> AppResult<bool> {
        let mut inner = lock(&self.inner)?;
        match inner.watches.iter_mut().find(|w| w.id == id && w.active) {
            Some(w) => {
                w.active = false;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn get(&self, id: WatchId) -> AppResult<Option<Watch>> {
        let inner = lock(&self.inner)?;
        Ok(inner.watches.iter().find(|w| w.id == id).cloned())
    }

    async fn all_active(&self) -> AppResult<Vec<Watch>> {
        let inner = lock(&self.inner)?;
        Ok(inner.watches.iter().filter(|w| w.active).cloned().collect())
    }
}

#[derive(Clone, Default)]
pub struct InMemorySeenSet {
    inner: Arc<Mutex<HashMap<WatchId, HashMap<String, DateTime<Utc>>>>>,
}

impl InMemorySeenSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self, watch: WatchId) -> usize {
        self.inner
            .lock()
            .map(|m| m.get(&watch).map_or(0, HashMap::len))
            .unwrap_or(0)
    }
}

#[async_trait]
impl SeenSet for InMemorySeenSet {
    async fn has_seen(&self, watch: WatchId, listing_id: &str) -> AppResult<bool> {
        let inner = lock(&self.inner)?;
        Ok(inner
            .get(&watch)
            .is_some_and(|seen| seen.contains_key(listing_id)))
    }

    async fn mark_seen(&self, watch: WatchId, listing_id: &str, at: DateTime<Utc>) -> AppResult<()> {
        let mut inner = lock(&self.inner)?;
        inner
            .entry(watch)
            .or_default()
            .entry(listing_id.to_string())
            .or_insert(at);
        Ok(())
    }

    async fn evict_older_than(&self, watch: WatchId, cutoff: DateTime<Utc>) -> AppResult<u64> {
        let mut inner = lock(&self.inner)?;
        let Some(seen) = inner.get_mut(&watch) else {
            return Ok(0);
        };
        let before = seen.len();
        seen.retain(|_, at| *at >= cutoff);
        Ok((before - seen.len()) as u64)
    }

    async fn evict_over_capacity(&self, watch: WatchId, keep: usize) -> AppResult<u64> {
        let mut inner = lock(&self.inner)?;
        let Some(seen) = inner.get_mut(&watch) else {
            return Ok(0);
        };
        if seen.len() <= keep {
            return Ok(0);
        }
        let mut by_age: Vec<(DateTime<Utc>, String)> =
            seen.iter().map(|(id, at)| (*at, id.clone())).collect();
        by_age.sort();
        let excess = seen.len() - keep;
        for (_, id) in by_age.into_iter().take(excess) {
            seen.remove(&id);
        }
        Ok(excess as u64)
    }

    async fn forget(&self, watch: WatchId) -> AppResult<()> {
        let mut inner = lock(&self.inner)?;
        inner.remove(&watch);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Platform;
    use chrono::Duration;

    fn new_watch(user: i64, query: &str) -> NewWatch {
        NewWatch::standard(UserId(user), Platform::Mercari, query, Some(5000.0))
    }

    #[tokio::test]
    async fn list_is_in_creation_order_and_scoped_to_user() {
        let store = InMemoryWatchStore::new(10);
        store.create(new_watch(1, "a")).await.unwrap();
        store.create(new_watch(2, "other")).await.unwrap();
        store.create(new_watch(1, "b")).await.unwrap();

        let queries: Vec<_> = store
            .list(UserId(1))
            .await
            .unwrap()
            .into_iter()
            .map(|w| w.query)
            .collect();
        assert_eq!(queries, ["a", "b"]);
    }

    #[tokio::test]
    async fn quota_counts_only_active_watches() {
        let store = InMemoryWatchStore::new(2);
        store.create(new_watch(1, "a")).await.unwrap();
        store.create(new_watch(1, "b")).await.unwrap();
        let err = store.create(new_watch(1, "c")).await.unwrap_err();
        assert!(matches!(err, AppError::QuotaExceeded { limit: 2 }));

        // another user is unaffected
        store.create(new_watch(2, "x")).await.unwrap();

        store.deactivate(UserId(1), 0).await.unwrap();
        store.create(new_watch(1, "c")).await.unwrap();
    }

    #[tokio::test]
    async fn deactivate_out_of_range_is_not_found() {
        let store = InMemoryWatchStore::new(5);
        store.create(new_watch(1, "a")).await.unwrap();
        let err = store.deactivate(UserId(1), 1).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
        let err = store.deactivate(UserId(9), 0).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn deactivate_by_index_shifts_remaining() {
        let store = InMemoryWatchStore::new(5);
        store.create(new_watch(1, "a")).await.unwrap();
        store.create(new_watch(1, "b")).await.unwrap();
        store.create(new_watch(1, "c")).await.unwrap();

        let stopped = store.deactivate(UserId(1), 1).await.unwrap();
        assert_eq!(stopped.query, "b");
        assert!(!stopped.active);

        let left: Vec<_> = store
            .list(UserId(1))
            .await
            .unwrap()
            .into_iter()
            .map(|w| w.query)
            .collect();
        assert_eq!(left, ["a", "c"]);
        assert_eq!(store.all_active().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn invalid_watch_is_rejected_before_quota() {
        let store = InMemoryWatchStore::new(0);
        let err = store
            .create(NewWatch::standard(UserId(1), Platform::Yahoo, "x", Some(-5.0)))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn seen_set_eviction() {
        let seen = InMemorySeenSet::new();
        let w = WatchId(1);
        let t0 = Utc::now();
        for i in 0..5 {
            seen.mark_seen(w, &format!("item-{i}"), t0 + Duration::seconds(i))
                .await
                .unwrap();
        }
        assert!(seen.has_seen(w, "item-0").await.unwrap());
        assert!(!seen.has_seen(WatchId(2), "item-0").await.unwrap());

        assert_eq!(seen.evict_over_capacity(w, 3).await.unwrap(), 2);
        assert!(!seen.has_seen(w, "item-1").await.unwrap());
        assert!(seen.has_seen(w, "item-2").await.unwrap());

        assert_eq!(
            seen.evict_older_than(w, t0 + Duration::seconds(4)).await.unwrap(),
            2
        );
        assert_eq!(seen.len(w), 1);

        seen.forget(w).await.unwrap();
        assert!(!seen.has_seen(w, "item-4").await.unwrap());
    }
}
