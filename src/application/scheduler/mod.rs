//! Drives periodic evaluation of every active watch.
//!
//! A single loop owns the due-time queue, the per-platform token buckets and
//! the per-watch slots; nothing else mutates them. Evaluations run as
//! independent tasks, at most `parallelism` at a time, and report back to the
//! loop when done. A watch is never queued while its evaluation is in flight,
//! so evaluations of the same watch never overlap.

pub mod due_queue;
pub mod parse_alarm;
pub mod rate_limiter;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

pub use due_queue::DueQueue;
pub use parse_alarm::ParseAlarm;
pub use rate_limiter::{PlatformLimiter, RateLimitConfig};

use crate::application::usecases::{Dispatcher, Evaluation};
use crate::application::{AppError, AppResult, NotificationSink, SeenSet, WatchStore};
use crate::domain::{Notification, Platform, SchedulePolicy, UserId, Watch, WatchId};

#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    pub policy: SchedulePolicy,
    /// Maximum concurrent watch evaluations.
    pub parallelism: usize,
    /// Delay before the first evaluation of watches loaded at startup.
    pub first_check_delay: Duration,
    /// How long shutdown waits for in-flight evaluations.
    pub shutdown_grace: Duration,
    pub rate_limits: HashMap<Platform, RateLimitConfig>,
    /// Consecutive parse errors on one platform before administrators are alerted.
    pub parse_alert_threshold: u32,
    pub admin_destinations: Vec<UserId>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            policy: SchedulePolicy::default(),
            parallelism: 4,
            first_check_delay: Duration::from_secs(15),
            shutdown_grace: Duration::from_secs(30),
            rate_limits: HashMap::new(),
            parse_alert_threshold: 3,
            admin_destinations: vec![],
        }
    }
}

#[derive(Debug)]
enum Command {
    Add(Watch),
    Remove(WatchId),
    Shutdown,
}

/// Cheap, cloneable way to talk to a running scheduler.
#[derive(Clone, Debug)]
pub struct SchedulerHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl SchedulerHandle {
    /// Start scheduling a newly created watch right away.
    pub fn add(&self, watch: Watch) {
        if self.tx.send(Command::Add(watch)).is_err() {
            debug!("scheduler not running; add ignored");
        }
    }

    /// Stop scheduling a watch. An evaluation already in flight completes but is not rescheduled.
    pub fn remove(&self, id: WatchId) {
        if self.tx.send(Command::Remove(id)).is_err() {
            debug!(watch_id = %id, "scheduler not running; remove ignored");
        }
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown);
    }
}

#[derive(Debug)]
struct Slot {
    watch: Watch,
    failures: u32,
    in_flight: bool,
    cancelled: bool,
}

type EvalResult = (WatchId, AppResult<Evaluation>);

pub struct Scheduler {
    store: Arc<dyn WatchStore>,
    seen: Arc<dyn SeenSet>,
    dispatcher: Arc<Dispatcher>,
    alert_sink: Option<Arc<dyn NotificationSink>>,
    config: SchedulerConfig,
    queue: DueQueue,
    limiter: PlatformLimiter,
    alarm: ParseAlarm,
    slots: HashMap<WatchId, Slot>,
    commands: Option<mpsc::UnboundedReceiver<Command>>,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn WatchStore>,
        seen: Arc<dyn SeenSet>,
        dispatcher: Arc<Dispatcher>,
        mut config: SchedulerConfig,
    ) -> (Self, SchedulerHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        config.parallelism = config.parallelism.max(1);
        let scheduler = Self {
            store,
            seen,
            dispatcher,
            alert_sink: None,
            limiter: PlatformLimiter::new(config.rate_limits.clone()),
            alarm: ParseAlarm::new(config.parse_alert_threshold),
            config,
            queue: DueQueue::new(),
            slots: HashMap::new(),
            commands: Some(rx),
        };
        (scheduler, SchedulerHandle { tx })
    }

    /// Where parse-failure alerts for administrators go.
    pub fn with_alert_sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.alert_sink = Some(sink);
        self
    }

    /// Runs until `SchedulerHandle::shutdown` is called or every handle is dropped.
    pub async fn run(mut self) -> AppResult<()> {
        let mut commands = self
            .commands
            .take()
            .ok_or_else(|| AppError::Internal("scheduler already started".into()))?;
        let watches = self.store.all_active().await?;
        info!(count = watches.len(), "scheduler starting");
        let first = Instant::now() + self.config.first_check_delay;
        for w in watches {
            self.admit(w, first);
        }

        let mut in_flight: JoinSet<EvalResult> = JoinSet::new();
        loop {
            let now = Instant::now();
            self.dispatch_due(now, &mut in_flight);

            let next_due = if in_flight.len() < self.config.parallelism {
                self.queue.next_due()
            } else {
                None
            };
            let wake = next_due.unwrap_or_else(|| now + Duration::from_secs(3600));

            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(Command::Add(w)) => self.admit(w, Instant::now()),
                    Some(Command::Remove(id)) => self.cancel(id),
                    Some(Command::Shutdown) | None => break,
                },
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => match joined {
                    Ok((id, result)) => self.complete(id, result, Instant::now()),
                    Err(e) => error!("evaluation task aborted: {e}"),
                },
                _ = sleep_until(wake), if next_due.is_some() => {}
            }
        }

        self.drain(in_flight).await;
        Ok(())
    }

    fn admit(&mut self, watch: Watch, at: Instant) {
        if !watch.active {
            return;
        }
        let id = watch.id;
        if watch.is_expired(Utc::now()) {
            self.queue.remove(id);
            self.slots.remove(&id);
            self.retire(id, "expired");
            return;
        }
        match self.slots.get_mut(&id) {
            Some(slot) => {
                slot.watch = watch;
                slot.cancelled = false;
                if slot.in_flight {
                    return;
                }
            }
            None => {
                self.slots.insert(
                    id,
                    Slot {
                        watch,
                        failures: 0,
                        in_flight: false,
                        cancelled: false,
                    },
                );
            }
        }
        if !self.queue.contains(id) {
            self.queue.schedule(id, at);
        }
    }

    fn cancel(&mut self, id: WatchId) {
        self.queue.remove(id);
        self.dispatcher.forget(id);
        match self.slots.get_mut(&id) {
            Some(slot) if slot.in_flight => slot.cancelled = true,
            Some(_) => {
                self.slots.remove(&id);
                // an evaluation that finished before this command may have marked listings
                self.forget_seen(id);
            }
            None => {}
        }
        debug!(watch_id = %id, "watch unscheduled");
    }

    fn dispatch_due(&mut self, now: Instant, in_flight: &mut JoinSet<EvalResult>) {
        while in_flight.len() < self.config.parallelism {
            let Some(id) = self.queue.pop_due(now) else {
                break;
            };
            let Some(slot) = self.slots.get_mut(&id) else {
                continue;
            };

            if slot.watch.is_expired(Utc::now()) {
                self.slots.remove(&id);
                self.retire(id, "expired");
                continue;
            }

            let platform = slot.watch.platform;
            if !self.limiter.try_acquire(platform, now) {
                let wait = self.limiter.time_until_available(platform, now);
                self.queue.schedule(id, now + wait);
                continue;
            }

            slot.in_flight = true;
            let watch = slot.watch.clone();
            let dispatcher = Arc::clone(&self.dispatcher);
            in_flight.spawn(async move {
                let id = watch.id;
                // inner task so a panic still reports back with the watch id
                let result =
                    tokio::spawn(async move { dispatcher.evaluate(&watch, Utc::now()).await })
                        .await
                        .unwrap_or_else(|e| Err(AppError::Internal(format!("evaluation panicked: {e}"))));
                (id, result)
            });
        }
    }

    fn complete(&mut self, id: WatchId, result: AppResult<Evaluation>, now: Instant) {
        let Some(slot) = self.slots.get_mut(&id) else {
            return;
        };
        slot.in_flight = false;
        if slot.cancelled {
            self.slots.remove(&id);
            self.dispatcher.forget(id);
            // the evaluation may have marked listings after stop dropped them
            self.forget_seen(id);
            debug!(watch_id = %id, "evaluation finished after stop; not rescheduled");
            return;
        }

        let platform = slot.watch.platform;
        let expires_at = slot.watch.expires_at;
        let next = match result {
            Ok(eval) => {
                slot.failures = 0;
                self.alarm.record_success(platform);
                if eval.blocked {
                    self.slots.remove(&id);
                    self.retire(id, "destination blocked");
                    return;
                }
                self.config
                    .policy
                    .after_success(&slot.watch, eval.soonest_end, Utc::now())
            }
            Err(e) => {
                slot.failures += 1;
                let failures = slot.failures;
                let delay = self.config.policy.backoff(failures);
                warn!(
                    watch_id = %id,
                    platform = %platform,
                    failures,
                    retry_in_secs = delay.as_secs(),
                    "evaluation failed: {e}"
                );
                if matches!(e, AppError::Parse(_)) {
                    if let Some(streak) = self.alarm.record_failure(platform) {
                        self.alert_admins(platform, streak, &e);
                    }
                }
                delay
            }
        };
        // wake at expiry so the watch is retired on time
        let next = match expires_at {
            Some(t) => next.min((t - Utc::now()).to_std().unwrap_or(Duration::ZERO)),
            None => next,
        };
        self.queue.schedule(id, now + next);
    }

    fn forget_seen(&self, id: WatchId) {
        let seen = Arc::clone(&self.seen);
        tokio::spawn(async move {
            if let Err(e) = seen.forget(id).await {
                warn!(watch_id = %id, "failed to drop seen records: {e}");
            }
        });
    }

    /// Deactivate in the store and drop seen records, off the loop.
    fn retire(&self, id: WatchId, reason: &'static str) {
        info!(watch_id = %id, reason, "retiring watch");
        self.dispatcher.forget(id);
        let store = Arc::clone(&self.store);
        let seen = Arc::clone(&self.seen);
        tokio::spawn(async move {
            match store.deactivate_by_id(id).await {
                Ok(_) => {
                    if let Err(e) = seen.forget(id).await {
                        warn!(watch_id = %id, "failed to drop seen records: {e}");
                    }
                }
                Err(e) => error!(watch_id = %id, "failed to deactivate watch: {e}"),
            }
        });
    }

    fn alert_admins(&self, platform: Platform, streak: u32, err: &AppError) {
        error!(
            platform = %platform,
            streak,
            "repeated parse failures, page layout may have changed: {err}"
        );
        let Some(sink) = &self.alert_sink else {
            return;
        };
        let text = format!(
            "⚠️ {streak} consecutive parse failures on {}. The page layout may have changed.\nLast error: {err}",
            platform.display_name()
        );
        for admin in &self.config.admin_destinations {
            let sink = Arc::clone(sink);
            let notification = Notification {
                destination: *admin,
                text: text.clone(),
                image_url: None,
            };
            tokio::spawn(async move {
                if let Err(e) = sink.send(&notification).await {
                    warn!(admin = %notification.destination, "admin alert failed: {e}");
                }
            });
        }
    }

    async fn drain(&self, mut in_flight: JoinSet<EvalResult>) {
        if in_flight.is_empty() {
            info!("scheduler stopped");
            return;
        }
        info!(in_flight = in_flight.len(), "waiting for in-flight evaluations");
        let drained = tokio::time::timeout(self.config.shutdown_grace, async {
            while let Some(joined) = in_flight.join_next().await {
                if let Ok((id, _)) = joined {
                    debug!(watch_id = %id, "evaluation finished during shutdown");
                }
            }
        })
        .await;
        if drained.is_err() {
            warn!("shutdown grace elapsed, abandoning in-flight evaluations");
            in_flight.abort_all();
        }
        info!("scheduler stopped");
    }
}
