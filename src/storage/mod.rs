pub(crate) mod sqlite;

use async_trait::async_trait;

use crate::error::Result;
use crate::job::{Job, JobId, JobStatus, ScheduledJob, ScheduledJobId};

pub(crate) use sqlite::SqliteStorage;

/// Thin mapping over the transactional SQL store.
///
/// One writer at a time is sufficient; the SQLite implementation enforces
/// this with a single-connection pool.
#[async_trait]
pub(crate) trait Storage: Send + Sync {
    /// Insert one pending job and return its id.
    async fn insert_job(&self, job_type: &str, data: &str, created_at: i64) -> Result<JobId>;

    /// Insert a batch of pending jobs atomically; ids come back in input order.
    async fn insert_jobs(
        &self,
        job_type: &str,
        data: &[String],
        created_at: i64,
    ) -> Result<Vec<JobId>>;

    /// Atomically claim the oldest pending job of `job_type`, flipping it to
    /// processing with `processing_at = now`.
    async fn claim_job(&self, job_type: &str, now: i64) -> Result<Option<Job>>;

    /// Flip a processing row to done. Returns the number of rows affected;
    /// zero means the row was not processing.
    async fn mark_done(&self, id: JobId, now: i64) -> Result<u64>;

    /// Flip a processing row to failed with the given error text.
    async fn mark_failed(&self, id: JobId, error: &str, now: i64) -> Result<u64>;

    async fn get_job(&self, id: JobId) -> Result<Option<Job>>;

    async fn count_jobs(&self, job_type: Option<&str>, status: Option<JobStatus>) -> Result<u64>;

    /// Distinct job types across all rows, sorted.
    async fn job_types(&self) -> Result<Vec<String>>;

    /// Insert a scheduled job, or update the cron expression and next run of
    /// the existing row for this type. The returned id is stable across
    /// updates.
    async fn upsert_scheduled_job(
        &self,
        job_type: &str,
        cron_expression: &str,
        next_run: i64,
    ) -> Result<ScheduledJobId>;

    async fn get_scheduled_job(&self, id: ScheduledJobId) -> Result<Option<ScheduledJob>>;

    /// All scheduled jobs in insertion order.
    async fn get_scheduled_jobs(&self) -> Result<Vec<ScheduledJob>>;

    /// Atomically claim an idle scheduled job with `next_run <= now`,
    /// flipping it to processing. Rows are taken in ascending `next_run`
    /// order.
    async fn claim_due_scheduled_job(&self, now: i64) -> Result<Option<ScheduledJob>>;

    /// Return a scheduled job to idle with a new `next_run`.
    async fn mark_scheduled_job_idle(&self, id: ScheduledJobId, next_run: i64) -> Result<()>;

    /// Whether any scheduled job of `job_type` has `next_run <= now`,
    /// regardless of its status.
    async fn has_due_scheduled_job(&self, job_type: &str, now: i64) -> Result<bool>;

    /// Delete done jobs with `done_at < cutoff`; returns the count deleted.
    async fn remove_done_jobs(&self, cutoff: i64) -> Result<u64>;

    /// Delete failed jobs with `failed_at < cutoff`; returns the count deleted.
    async fn remove_failed_jobs(&self, cutoff: i64) -> Result<u64>;

    /// Move processing jobs with `processing_at < cutoff` back to pending,
    /// clearing `processing_at`; returns the count moved.
    async fn requeue_timed_out_jobs(&self, cutoff: i64) -> Result<u64>;

    /// Close the underlying pool.
    async fn close(&self);
}
