use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cron;
use crate::error::{Error, Result};
use crate::job::{now_millis, Job, JobId, JobStatus, ScheduledJob, ScheduledJobId};
use crate::maintenance::Maintenance;
use crate::serializer::{self, Serializer};
use crate::storage::{SqliteStorage, Storage};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

type Hook = Box<dyn Fn(u64) + Send + Sync>;

/// Observational callbacks fired by maintenance operations.
///
/// Hooks are best-effort: a panicking hook is caught and logged and never
/// influences row state.
#[derive(Default)]
pub(crate) struct QueueHooks {
    on_done_jobs_removed: Option<Hook>,
    on_failed_jobs_removed: Option<Hook>,
    on_processing_jobs_requeued: Option<Hook>,
}

impl QueueHooks {
    fn fire(slot: &Option<Hook>, name: &str, count: u64) {
        if let Some(hook) = slot {
            if catch_unwind(AssertUnwindSafe(|| hook(count))).is_err() {
                warn!(hook = name, "hook panicked");
            }
        }
    }

    pub(crate) fn done_jobs_removed(&self, count: u64) {
        Self::fire(&self.on_done_jobs_removed, "on_done_jobs_removed", count);
    }

    pub(crate) fn failed_jobs_removed(&self, count: u64) {
        Self::fire(&self.on_failed_jobs_removed, "on_failed_jobs_removed", count);
    }

    pub(crate) fn processing_jobs_requeued(&self, count: u64) {
        Self::fire(
            &self.on_processing_jobs_requeued,
            "on_processing_jobs_requeued",
            count,
        );
    }
}

/// The queue engine: accepts jobs, claims them atomically, records
/// transitions, and owns the maintenance loop.
///
/// `Queue` is cheap to clone; clones share the same store and maintenance
/// task. Call [`Queue::close`] when done.
#[derive(Clone)]
pub struct Queue {
    storage: Arc<dyn Storage>,
    serializer: Serializer,
    timeout: Duration,
    maintenance: Arc<Maintenance>,
    shutdown: CancellationToken,
    maintenance_handle: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl Queue {
    /// Start building a queue over the given SQLite URL, e.g.
    /// `sqlite://jobs.db?mode=rwc` or `sqlite::memory:`.
    pub fn builder(database_url: impl Into<String>) -> QueueBuilder {
        QueueBuilder {
            database_url: database_url.into(),
            serializer: serializer::json(),
            timeout: DEFAULT_TIMEOUT,
            maintenance_interval: None,
            remove_done_jobs_older_than: None,
            remove_failed_jobs_older_than: None,
            hooks: QueueHooks::default(),
        }
    }

    /// Connect with default configuration.
    pub async fn new(database_url: impl Into<String>) -> Result<Self> {
        Self::builder(database_url).build().await
    }

    fn serialize<T: Serialize>(&self, payload: &T) -> Result<String> {
        let value = serde_json::to_value(payload)?;
        Ok((self.serializer)(&value)?)
    }

    /// Enqueue one job of `job_type`; returns its id.
    pub async fn add<T: Serialize>(&self, job_type: &str, payload: &T) -> Result<JobId> {
        let data = self.serialize(payload)?;
        let id = self.storage.insert_job(job_type, &data, now_millis()).await?;

        debug!(job_id = %id, job_type, "job added");
        Ok(id)
    }

    /// Enqueue a batch atomically; ids come back in input order.
    pub async fn add_many<T: Serialize>(
        &self,
        job_type: &str,
        payloads: &[T],
    ) -> Result<Vec<JobId>> {
        let data = payloads
            .iter()
            .map(|payload| self.serialize(payload))
            .collect::<Result<Vec<_>>>()?;

        let ids = self.storage.insert_jobs(job_type, &data, now_millis()).await?;

        debug!(job_type, count = ids.len(), "jobs added");
        Ok(ids)
    }

    /// Atomically claim the oldest pending job of `job_type`, if any.
    ///
    /// Ties on `created_at` break by ascending id, so claim order is
    /// deterministic. Concurrent callers never receive the same job.
    pub async fn get_and_mark_job_as_processing(&self, job_type: &str) -> Result<Option<Job>> {
        self.storage.claim_job(job_type, now_millis()).await
    }

    /// Record a processing job as done.
    ///
    /// Returns [`Error::NotProcessing`] when the row is no longer in the
    /// processing state, e.g. because the maintenance loop requeued it.
    pub async fn mark_job_as_done(&self, id: JobId) -> Result<()> {
        match self.storage.mark_done(id, now_millis()).await? {
            0 => Err(Error::NotProcessing(id)),
            _ => Ok(()),
        }
    }

    /// Record a processing job as failed with the given error text.
    pub async fn mark_job_as_failed(&self, id: JobId, error: &str) -> Result<()> {
        match self.storage.mark_failed(id, error, now_millis()).await? {
            0 => Err(Error::NotProcessing(id)),
            _ => Ok(()),
        }
    }

    pub async fn get_job_by_id(&self, id: JobId) -> Result<Option<Job>> {
        self.storage.get_job(id).await
    }

    /// Count jobs, optionally filtered by type and/or status.
    pub async fn count_jobs(
        &self,
        job_type: Option<&str>,
        status: Option<JobStatus>,
    ) -> Result<u64> {
        self.storage.count_jobs(job_type, status).await
    }

    /// Distinct job types across all rows, sorted.
    pub async fn get_job_types(&self) -> Result<Vec<String>> {
        self.storage.job_types().await
    }

    /// Create or update the recurring schedule for `job_type`.
    ///
    /// At most one schedule exists per type; re-scheduling updates the cron
    /// expression, recomputes `next_run` from now, and returns the original
    /// id. Fails with [`Error::InvalidCron`] on a malformed expression.
    pub async fn schedule(
        &self,
        job_type: &str,
        cron_expression: &str,
    ) -> Result<ScheduledJobId> {
        let next_run = cron::next_run_after(cron_expression, now_millis())?;
        let id = self
            .storage
            .upsert_scheduled_job(job_type, cron_expression, next_run)
            .await?;

        info!(scheduled_job_id = %id, job_type, cron = cron_expression, "job scheduled");
        Ok(id)
    }

    /// All scheduled jobs in insertion order.
    pub async fn get_scheduled_jobs(&self) -> Result<Vec<ScheduledJob>> {
        self.storage.get_scheduled_jobs().await
    }

    pub async fn get_scheduled_job_by_id(
        &self,
        id: ScheduledJobId,
    ) -> Result<Option<ScheduledJob>> {
        self.storage.get_scheduled_job(id).await
    }

    /// Atomically claim an idle scheduled job whose `next_run` has passed,
    /// flipping it to processing. Used by the maintenance loop; exposed for
    /// callers that drive schedule materialisation themselves.
    pub async fn get_and_mark_scheduled_job_as_processing(
        &self,
    ) -> Result<Option<ScheduledJob>> {
        self.storage.claim_due_scheduled_job(now_millis()).await
    }

    /// Return a scheduled job to idle with a new `next_run`.
    pub async fn mark_scheduled_job_as_idle(
        &self,
        id: ScheduledJobId,
        next_run: i64,
    ) -> Result<()> {
        self.storage.mark_scheduled_job_idle(id, next_run).await
    }

    /// Delete done jobs whose `done_at` is older than `older_than` ago;
    /// returns the count deleted and fires the removal hook.
    pub async fn remove_done_jobs(&self, older_than: Duration) -> Result<u64> {
        self.maintenance.remove_done_jobs(older_than).await
    }

    /// Delete failed jobs whose `failed_at` is older than `older_than` ago.
    pub async fn remove_failed_jobs(&self, older_than: Duration) -> Result<u64> {
        self.maintenance.remove_failed_jobs(older_than).await
    }

    /// Move processing jobs older than `timeout` back to pending; returns
    /// the count moved and fires the requeue hook.
    pub async fn requeue_timed_out_jobs(&self, timeout: Duration) -> Result<u64> {
        self.maintenance.requeue_timed_out(timeout).await
    }

    /// Run one maintenance tick now: fire due schedules, requeue timed-out
    /// jobs, reap configured terminal jobs. Serialized with the background
    /// loop; errors are logged, not returned.
    pub async fn run_maintenance(&self) {
        self.maintenance.tick().await;
    }

    /// Stop the maintenance loop, waiting out any in-flight tick, cancel
    /// workers bound to this queue, and close the store. Idempotent.
    pub async fn close(&self) {
        self.shutdown.cancel();

        let handle = self.maintenance_handle.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        self.storage.close().await;
        info!("queue closed");
    }

    /// Timeout used by the maintenance loop to reclaim abandoned jobs.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub(crate) fn child_shutdown_token(&self) -> CancellationToken {
        self.shutdown.child_token()
    }

    pub(crate) async fn has_due_schedule(&self, job_type: &str) -> Result<bool> {
        self.storage
            .has_due_scheduled_job(job_type, now_millis())
            .await
    }
}

/// Fluent configuration for [`Queue`].
pub struct QueueBuilder {
    database_url: String,
    serializer: Serializer,
    timeout: Duration,
    maintenance_interval: Option<Duration>,
    remove_done_jobs_older_than: Option<Duration>,
    remove_failed_jobs_older_than: Option<Duration>,
    hooks: QueueHooks,
}

impl QueueBuilder {
    /// Override the payload serializer. The default produces canonical JSON.
    pub fn serializer(mut self, serializer: Serializer) -> Self {
        self.serializer = serializer;
        self
    }

    /// Processing-row age after which the maintenance loop requeues it.
    /// Defaults to 60 seconds.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Period between maintenance ticks. Defaults to the timeout.
    pub fn maintenance_interval(mut self, interval: Duration) -> Self {
        self.maintenance_interval = Some(interval);
        self
    }

    /// Reap done jobs older than this age on every maintenance tick.
    pub fn remove_done_jobs_older_than(mut self, older_than: Duration) -> Self {
        self.remove_done_jobs_older_than = Some(older_than);
        self
    }

    /// Reap failed jobs older than this age on every maintenance tick.
    pub fn remove_failed_jobs_older_than(mut self, older_than: Duration) -> Self {
        self.remove_failed_jobs_older_than = Some(older_than);
        self
    }

    pub fn on_done_jobs_removed(mut self, hook: impl Fn(u64) + Send + Sync + 'static) -> Self {
        self.hooks.on_done_jobs_removed = Some(Box::new(hook));
        self
    }

    pub fn on_failed_jobs_removed(mut self, hook: impl Fn(u64) + Send + Sync + 'static) -> Self {
        self.hooks.on_failed_jobs_removed = Some(Box::new(hook));
        self
    }

    pub fn on_processing_jobs_requeued(
        mut self,
        hook: impl Fn(u64) + Send + Sync + 'static,
    ) -> Self {
        self.hooks.on_processing_jobs_requeued = Some(Box::new(hook));
        self
    }

    /// Connect, migrate, and start the maintenance loop.
    pub async fn build(self) -> Result<Queue> {
        let storage: Arc<dyn Storage> = Arc::new(SqliteStorage::connect(&self.database_url).await?);
        let interval = self.maintenance_interval.unwrap_or(self.timeout);

        let maintenance = Arc::new(Maintenance::new(
            Arc::clone(&storage),
            Arc::clone(&self.serializer),
            self.hooks,
            self.timeout,
            interval,
            self.remove_done_jobs_older_than,
            self.remove_failed_jobs_older_than,
        ));

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(Arc::clone(&maintenance).run(shutdown.clone()));

        Ok(Queue {
            storage,
            serializer: self.serializer,
            timeout: self.timeout,
            maintenance,
            shutdown,
            maintenance_handle: Arc::new(Mutex::new(Some(handle))),
        })
    }
}
