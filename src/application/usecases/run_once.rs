use chrono::Utc;
use tracing::{error, info, warn};

use crate::application::usecases::Dispatcher;
use crate::application::{AppResult, SeenSet, WatchStore};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub evaluated: usize,
    pub failed: usize,
    pub notified: usize,
    pub retired: usize,
}

/// Evaluates every active watch a single time, in creation order.
pub struct RunOnceUseCase<'a> {
    pub store: &'a dyn WatchStore,
    pub seen: &'a dyn SeenSet,
    pub dispatcher: &'a Dispatcher,
}

impl<'a> RunOnceUseCase<'a> {
    pub async fn execute(&self) -> AppResult<RunSummary> {
        let watches = self.store.all_active().await?;
        let mut summary = RunSummary::default();

        for w in watches {
            let now = Utc::now();
            if w.is_expired(now) {
                self.retire(w.id).await;
                summary.retired += 1;
                continue;
            }

            // one watch failing must not stop the others
            match self.dispatcher.evaluate(&w, now).await {
                Ok(eval) => {
                    summary.evaluated += 1;
                    summary.notified += eval.notified;
                    if eval.blocked {
                        self.retire(w.id).await;
                        summary.retired += 1;
                    }
                }
                Err(e) => {
                    summary.failed += 1;
                    warn!(watch_id = %w.id, platform = %w.platform, "evaluation failed: {e}");
                }
            }
        }

        info!(
            evaluated = summary.evaluated,
            failed = summary.failed,
            notified = summary.notified,
            "run once finished"
        );
        Ok(summary)
    }

    async fn retire(&self, id: crate::domain::WatchId) {
        self.dispatcher.forget(id);
        if let Err(e) = self.store.deactivate_by_id(id).await {
            error!(watch_id = %id, "failed to deactivate watch: {e}");
            return;
        }
        if let Err(e) = self.seen.forget(id).await {
            warn!(watch_id = %id, "failed to drop seen records: {e}");
        }
    }
}
