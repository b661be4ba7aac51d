use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::application::{AppError, AppResult, SourceAdapter};
use crate::domain::{Listing, Platform, SortOrder};

type Key = (Platform, String);

/// Scriptable source for tests and `--dry-run`.
///
/// Each `(platform, query)` returns its configured listings; queued failures
/// are returned first, one per call. Tracks call counts and the highest
/// number of concurrent fetches observed.
#[derive(Clone, Default)]
pub struct FakeSource {
    inner: Arc<Mutex<FakeInner>>,
    calls: Arc<AtomicUsize>,
    running: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

#[derive(Default)]
struct FakeInner {
    listings: HashMap<Key, Vec<Listing>>,
    failures: HashMap<Key, VecDeque<AppError>>,
    call_log: Vec<(Platform, String, SortOrder, tokio::time::Instant)>,
    delay: Option<Duration>,
}

impl FakeSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Listing with `id` doubling as its URL.
    pub fn listing(id: &str, price: f64) -> Listing {
        Listing {
            id: id.to_string(),
            title: format!("item {id}"),
            price,
            url: format!("https://example.com/{id}"),
            image_url: None,
            ends_at: None,
        }
    }

    pub fn auction(id: &str, price: f64, ends_at: DateTime<Utc>) -> Listing {
        Listing {
            ends_at: Some(ends_at),
            ..Self::listing(id, price)
        }
    }

    pub fn set_listings(&self, platform: Platform, query: &str, listings: Vec<Listing>) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.listings.insert((platform, query.to_string()), listings);
        }
    }

    pub fn push_failure(&self, platform: Platform, query: &str, err: AppError) {
        if let Ok(mut inner) = self.inner.lock() {
            inner
                .failures
                .entry((platform, query.to_string()))
                .or_default()
                .push_back(err);
        }
    }

    /// Every fetch sleeps this long before answering.
    pub fn set_delay(&self, delay: Duration) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.delay = Some(delay);
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn calls_for(&self, platform: Platform, query: &str) -> usize {
        self.call_times(platform, query).len()
    }

    /// When each fetch of `(platform, query)` started, in tokio time.
    pub fn call_times(&self, platform: Platform, query: &str) -> Vec<tokio::time::Instant> {
        self.inner
            .lock()
            .map(|inner| {
                inner
                    .call_log
                    .iter()
                    .filter(|(p, q, _, _)| *p == platform && q == query)
                    .map(|(_, _, _, at)| *at)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn last_sort(&self, platform: Platform, query: &str) -> Option<SortOrder> {
        self.inner.lock().ok().and_then(|inner| {
            inner
                .call_log
                .iter()
                .rev()
                .find(|(p, q, _, _)| *p == platform && q == query)
                .map(|(_, _, s, _)| *s)
        })
    }

    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceAdapter for FakeSource {
    async fn fetch(&self, platform: Platform, query: &str, sort: SortOrder) -> AppResult<Vec<Listing>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now_running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now_running, Ordering::SeqCst);

        let (delay, outcome) = {
            let mut inner = self
                .inner
                .lock()
                .map_err(|_| AppError::Internal("lock poisoned".into()))?;
            inner
                .call_log
                .push((platform, query.to_string(), sort, tokio::time::Instant::now()));
            let key = (platform, query.to_string());
            let outcome = match inner.failures.get_mut(&key).and_then(VecDeque::pop_front) {
                Some(err) => Err(err),
                None => Ok(inner.listings.get(&key).cloned().unwrap_or_default()),
            };
            (inner.delay, outcome)
        };

        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
        self.running.fetch_sub(1, Ordering::SeqCst);
        outcome
    }
}
