use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::cron;
use crate::error::Result;
use crate::job::now_millis;
use crate::queue::QueueHooks;
use crate::serializer::{self, Serializer};
use crate::storage::Storage;

/// The queue's periodic background task: fires due schedules, requeues
/// timed-out processing jobs, and reaps aged terminal jobs.
pub(crate) struct Maintenance {
    storage: Arc<dyn Storage>,
    serializer: Serializer,
    hooks: QueueHooks,
    timeout: Duration,
    interval: Duration,
    remove_done_older_than: Option<Duration>,
    remove_failed_older_than: Option<Duration>,
    // Ticks never overlap: the loop and any explicit tick share this lock.
    tick_lock: tokio::sync::Mutex<()>,
}

impl Maintenance {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        storage: Arc<dyn Storage>,
        serializer: Serializer,
        hooks: QueueHooks,
        timeout: Duration,
        interval: Duration,
        remove_done_older_than: Option<Duration>,
        remove_failed_older_than: Option<Duration>,
    ) -> Self {
        Self {
            storage,
            serializer,
            hooks,
            timeout,
            interval,
            remove_done_older_than,
            remove_failed_older_than,
            tick_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Run until shutdown is signaled. An in-flight tick always completes
    /// before the loop observes cancellation.
    pub(crate) async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(interval = ?self.interval, "maintenance loop started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("maintenance loop shutting down");
                    break;
                }
                _ = tokio::time::sleep(self.interval) => {
                    self.tick().await;
                }
            }
        }
    }

    /// One maintenance pass. Errors are logged, never propagated; a failing
    /// step does not stop the following steps or the loop.
    pub(crate) async fn tick(&self) {
        let _guard = self.tick_lock.lock().await;

        if let Err(error) = self.fire_due_schedules().await {
            error!(error = %error, "failed to fire due scheduled jobs");
        }

        if let Err(error) = self.requeue_timed_out(self.timeout).await {
            error!(error = %error, "failed to requeue timed-out jobs");
        }

        if let Some(older_than) = self.remove_done_older_than {
            if let Err(error) = self.remove_done_jobs(older_than).await {
                error!(error = %error, "failed to remove done jobs");
            }
        }

        if let Some(older_than) = self.remove_failed_older_than {
            if let Err(error) = self.remove_failed_jobs(older_than).await {
                error!(error = %error, "failed to remove failed jobs");
            }
        }
    }

    /// Materialise every due schedule into one pending job.
    ///
    /// Fires missed while the process was down collapse into a single
    /// materialisation, and the next run is computed from now rather than
    /// from the missed instant.
    async fn fire_due_schedules(&self) -> Result<()> {
        loop {
            let now = now_millis();
            let Some(scheduled) = self.storage.claim_due_scheduled_job(now).await? else {
                return Ok(());
            };

            debug!(
                scheduled_job_id = %scheduled.id,
                job_type = %scheduled.job_type,
                "firing scheduled job"
            );

            let next_run = match cron::next_run_after(&scheduled.cron_expression, now) {
                Ok(next_run) => next_run,
                Err(error) => {
                    // The expression was validated at schedule time; if the
                    // row no longer parses, push it out one interval instead
                    // of reclaiming it within the same tick.
                    error!(
                        scheduled_job_id = %scheduled.id,
                        cron = %scheduled.cron_expression,
                        error = %error,
                        "failed to compute next run"
                    );
                    now + self.interval.as_millis() as i64
                }
            };

            let data = match (self.serializer)(&serializer::empty_object()) {
                Ok(data) => data,
                Err(error) => {
                    error!(
                        scheduled_job_id = %scheduled.id,
                        error = %error,
                        "failed to serialize scheduled job payload"
                    );
                    self.storage
                        .mark_scheduled_job_idle(scheduled.id, next_run)
                        .await?;
                    continue;
                }
            };

            if let Err(error) = self
                .storage
                .insert_job(&scheduled.job_type, &data, now_millis())
                .await
            {
                // Put the row back to idle before surfacing the store error
                // so the schedule is not left stuck in processing.
                let _ = self
                    .storage
                    .mark_scheduled_job_idle(scheduled.id, scheduled.next_run)
                    .await;
                return Err(error);
            }

            self.storage
                .mark_scheduled_job_idle(scheduled.id, next_run)
                .await?;
        }
    }

    pub(crate) async fn requeue_timed_out(&self, timeout: Duration) -> Result<u64> {
        let cutoff = now_millis() - timeout.as_millis() as i64;
        let count = self.storage.requeue_timed_out_jobs(cutoff).await?;

        if count > 0 {
            debug!(count, "requeued timed-out processing jobs");
        }

        self.hooks.processing_jobs_requeued(count);
        Ok(count)
    }

    pub(crate) async fn remove_done_jobs(&self, older_than: Duration) -> Result<u64> {
        let cutoff = now_millis() - older_than.as_millis() as i64;
        let count = self.storage.remove_done_jobs(cutoff).await?;

        if count > 0 {
            debug!(count, "removed aged done jobs");
        }

        self.hooks.done_jobs_removed(count);
        Ok(count)
    }

    pub(crate) async fn remove_failed_jobs(&self, older_than: Duration) -> Result<u64> {
        let cutoff = now_millis() - older_than.as_millis() as i64;
        let count = self.storage.remove_failed_jobs(cutoff).await?;

        if count > 0 {
            debug!(count, "removed aged failed jobs");
        }

        self.hooks.failed_jobs_removed(count);
        Ok(count)
    }
}
