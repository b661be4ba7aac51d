use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::application::{
    AppError, AppResult, EventPublisher, NotificationSink, SeenSet, SourceAdapter,
};
use crate::domain::{matches, soonest_pending_end, sort_listings, NotificationEvent, Watch, WatchId};

#[derive(Clone, Debug)]
pub struct DispatchConfig {
    /// Pause between consecutive sends inside one evaluation.
    pub send_spacing: Duration,
    /// Failed sends of the same listing before it is given up on and marked seen.
    pub max_delivery_attempts: u32,
    /// Per-watch cap on seen records; 0 keeps everything.
    pub seen_history_cap: usize,
    /// Seen records older than this are dropped after each evaluation.
    pub seen_retention: Option<Duration>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            send_spacing: Duration::from_millis(1200),
            max_delivery_attempts: 3,
            seen_history_cap: 0,
            seen_retention: None,
        }
    }
}

/// Result of evaluating one watch once.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Evaluation {
    pub fetched: usize,
    pub matched: usize,
    pub notified: usize,
    pub failed: usize,
    /// The destination refused delivery; the watch should be retired.
    pub blocked: bool,
    /// Earliest end of an auction that passes the price bound but is not yet in the window.
    pub soonest_end: Option<DateTime<Utc>>,
}

/// Resolves new matching listings for a watch and fans them out to the sink.
pub struct Dispatcher {
    source: Arc<dyn SourceAdapter>,
    seen: Arc<dyn SeenSet>,
    sink: Arc<dyn NotificationSink>,
    publisher: Option<Arc<dyn EventPublisher>>,
    config: DispatchConfig,
    attempts: Mutex<HashMap<(WatchId, String), u32>>,
}

impl Dispatcher {
    pub fn new(
        source: Arc<dyn SourceAdapter>,
        seen: Arc<dyn SeenSet>,
        sink: Arc<dyn NotificationSink>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            source,
            seen,
            sink,
            publisher: None,
            config,
            attempts: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Fetch, filter, dedup and notify for one watch.
    ///
    /// Source errors are returned untouched so the scheduler can back off; nothing is
    /// marked seen in that case. A listing is marked seen only after its send was
    /// attempted, so a crash between the two yields a duplicate rather than a loss.
    pub async fn evaluate(&self, watch: &Watch, now: DateTime<Utc>) -> AppResult<Evaluation> {
        let listings = self
            .source
            .fetch(watch.platform, &watch.query, watch.sort)
            .await?;

        let mut eval = Evaluation {
            fetched: listings.len(),
            soonest_end: soonest_pending_end(watch, &listings, now),
            ..Default::default()
        };

        let mut ids = HashSet::new();
        let mut candidates: Vec<_> = listings
            .into_iter()
            .filter(|l| matches(watch, l, now))
            .filter(|l| ids.insert(l.id.clone()))
            .collect();
        sort_listings(&mut candidates, watch.sort);
        eval.matched = candidates.len();

        let mut fresh = Vec::with_capacity(candidates.len());
        for listing in candidates {
            if !self.seen.has_seen(watch.id, &listing.id).await? {
                fresh.push(listing);
            }
        }

        if !fresh.is_empty() {
            info!(
                watch_id = %watch.id,
                user = %watch.user,
                platform = %watch.platform,
                count = fresh.len(),
                "new matching listings"
            );
        }

        let total = fresh.len();
        for (i, listing) in fresh.into_iter().enumerate() {
            let event = NotificationEvent {
                destination: watch.user,
                watch: watch.clone(),
                listing,
                detected_at: now,
            };

            match self.sink.send(&event.render()).await {
                Ok(()) => {
                    self.seen
                        .mark_seen(watch.id, &event.listing.id, Utc::now())
                        .await?;
                    self.clear_attempts(watch.id, &event.listing.id);
                    eval.notified += 1;
                    if let Some(publisher) = &self.publisher {
                        if let Err(e) = publisher.publish(&event).await {
                            debug!(watch_id = %watch.id, "publish failed: {e}");
                        }
                    }
                }
                Err(AppError::DestinationBlocked(user)) => {
                    warn!(watch_id = %watch.id, user = %user, "destination blocked the bot");
                    eval.blocked = true;
                    break;
                }
                Err(e) => {
                    eval.failed += 1;
                    let attempts = self.record_attempt(watch.id, &event.listing.id);
                    if attempts >= self.config.max_delivery_attempts {
                        warn!(
                            watch_id = %watch.id,
                            listing = %event.listing.id,
                            attempts,
                            "giving up on notification: {e}"
                        );
                        self.seen
                            .mark_seen(watch.id, &event.listing.id, Utc::now())
                            .await?;
                        self.clear_attempts(watch.id, &event.listing.id);
                    } else {
                        warn!(
                            watch_id = %watch.id,
                            listing = %event.listing.id,
                            attempts,
                            "notification failed, will retry next cycle: {e}"
                        );
                    }
                }
            }

            if i + 1 < total && !self.config.send_spacing.is_zero() {
                tokio::time::sleep(self.config.send_spacing).await;
            }
        }

        self.evict(watch, now).await?;
        self.prune_attempts(watch.id, &ids);
        Ok(eval)
    }

    /// Drops retry bookkeeping for a watch that is no longer evaluated.
    pub fn forget(&self, watch: WatchId) {
        self.lock_attempts().retain(|(w, _), _| *w != watch);
    }

    /// Listings of `watch` whose delivery failed and will be retried.
    pub fn pending_retries(&self, watch: WatchId) -> usize {
        self.lock_attempts().keys().filter(|(w, _)| *w == watch).count()
    }

    // listings that left the results will not be retried
    fn prune_attempts(&self, watch: WatchId, current: &HashSet<String>) {
        self.lock_attempts()
            .retain(|(w, listing), _| *w != watch || current.contains(listing));
    }

    fn lock_attempts(&self) -> std::sync::MutexGuard<'_, HashMap<(WatchId, String), u32>> {
        self.attempts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn evict(&self, watch: &Watch, now: DateTime<Utc>) -> AppResult<()> {
        if let Some(retention) = self.config.seen_retention {
            if let Ok(retention) = chrono::Duration::from_std(retention) {
                self.seen.evict_older_than(watch.id, now - retention).await?;
            }
        }
        if self.config.seen_history_cap > 0 {
            let dropped = self
                .seen
                .evict_over_capacity(watch.id, self.config.seen_history_cap)
                .await?;
            if dropped > 0 {
                debug!(watch_id = %watch.id, dropped, "trimmed seen history");
            }
        }
        Ok(())
    }

    fn record_attempt(&self, watch: WatchId, listing_id: &str) -> u32 {
        let mut attempts = self.lock_attempts();
        let n = attempts.entry((watch, listing_id.to_string())).or_insert(0);
        *n += 1;
        *n
    }

    fn clear_attempts(&self, watch: WatchId, listing_id: &str) {
        self.lock_attempts().remove(&(watch, listing_id.to_string()));
    }
}
