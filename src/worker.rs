use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::job::{Job, JobStatus};
use crate::queue::Queue;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

type Handler = Arc<
    dyn Fn(Job) -> Pin<Box<dyn Future<Output = std::result::Result<(), String>> + Send>>
        + Send
        + Sync,
>;

type JobHook = Box<dyn Fn(&Job) + Send + Sync>;
type FailedHook = Box<dyn Fn(&Job, &str) + Send + Sync>;

#[derive(Default)]
struct WorkerHooks {
    on_processing: Option<JobHook>,
    on_completed: Option<JobHook>,
    on_failed: Option<FailedHook>,
}

impl WorkerHooks {
    // Hook panics are contained so they can never change the recorded
    // outcome of a job.
    fn processing(&self, job: &Job) {
        if let Some(hook) = &self.on_processing {
            if catch_unwind(AssertUnwindSafe(|| hook(job))).is_err() {
                warn!(job_id = %job.id, "on_processing hook panicked");
            }
        }
    }

    fn completed(&self, job: &Job) {
        if let Some(hook) = &self.on_completed {
            if catch_unwind(AssertUnwindSafe(|| hook(job))).is_err() {
                warn!(job_id = %job.id, "on_completed hook panicked");
            }
        }
    }

    fn failed(&self, job: &Job, error: &str) {
        if let Some(hook) = &self.on_failed {
            if catch_unwind(AssertUnwindSafe(|| hook(job, error))).is_err() {
                warn!(job_id = %job.id, "on_failed hook panicked");
            }
        }
    }
}

struct WorkerInner {
    queue: Queue,
    job_type: String,
    handler: Handler,
    hooks: WorkerHooks,
    poll_interval: Duration,
}

impl WorkerInner {
    async fn run(&self, shutdown: CancellationToken) {
        info!(job_type = %self.job_type, "worker started");

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            match self
                .queue
                .get_and_mark_job_as_processing(&self.job_type)
                .await
            {
                Ok(Some(job)) => self.process(job).await,
                Ok(None) => {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.poll_interval) => {}
                    }
                }
                Err(e) => {
                    error!(job_type = %self.job_type, error = %e, "failed to claim job");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.poll_interval) => {}
                    }
                }
            }
        }

        info!(job_type = %self.job_type, "worker stopped");
    }

    /// Invoke the handler and record the outcome.
    ///
    /// Marks are best-effort: once the handler has run, a failing mark is
    /// logged and swallowed. The row is either already terminal or pending
    /// again after a timeout requeue, and the requeue logic owns recovery.
    async fn process(&self, job: Job) {
        debug!(job_id = %job.id, job_type = %job.job_type, "processing job");
        self.hooks.processing(&job);

        match self.execute(job.clone()).await {
            Ok(()) => {
                debug!(job_id = %job.id, "job done");

                if let Err(e) = self.queue.mark_job_as_done(job.id).await {
                    error!(job_id = %job.id, error = %e, "failed to mark job as done");
                }

                self.hooks.completed(&job);
            }
            Err(message) => {
                warn!(job_id = %job.id, error = %message, "job failed");

                if let Err(e) = self.queue.mark_job_as_failed(job.id, &message).await {
                    error!(job_id = %job.id, error = %e, "failed to mark job as failed");
                }

                self.hooks.failed(&job, &message);
            }
        }
    }

    /// Run the handler on its own task so a panic is captured as a failure
    /// text instead of tearing down the worker loop.
    async fn execute(&self, job: Job) -> std::result::Result<(), String> {
        let future = (self.handler)(job);
        let handle = tokio::spawn(future);

        let join_to_error = |e: JoinError| {
            if e.is_panic() {
                "job handler panicked".to_string()
            } else {
                "job handler cancelled".to_string()
            }
        };

        handle.await.map_err(join_to_error)?
    }
}

/// A worker binds one job type to one handler and processes matching jobs
/// until stopped.
///
/// Any number of workers may run against the same type; the claim protocol
/// serialises dispatch. Each worker runs at most one handler at a time.
///
/// # Example
/// ```ignore
/// let worker = Worker::builder(&queue, "send_email", |job: Job| async move {
///     let args: EmailArgs = serde_json::from_str(&job.data).map_err(|e| e.to_string())?;
///     send(args).await
/// })
/// .on_failed(|job, error| println!("{} failed: {error}", job.id))
/// .build();
///
/// worker.start().await;
/// ```
pub struct Worker {
    inner: Arc<WorkerInner>,
    // The running loop and the token that cancels it. A token lives for one
    // run only, so a stopped worker can be started again.
    running: Mutex<Option<(JoinHandle<()>, CancellationToken)>>,
}

impl Worker {
    /// Create a worker with default configuration.
    pub fn new<F, Fut>(queue: &Queue, job_type: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Job) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), String>> + Send + 'static,
    {
        Self::builder(queue, job_type, handler).build()
    }

    /// Start building a worker for `job_type`.
    ///
    /// Handler errors are recorded as the job's failure text; a handler
    /// panic is captured the same way.
    pub fn builder<F, Fut>(
        queue: &Queue,
        job_type: impl Into<String>,
        handler: F,
    ) -> WorkerBuilder
    where
        F: Fn(Job) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), String>> + Send + 'static,
    {
        WorkerBuilder {
            queue: queue.clone(),
            job_type: job_type.into(),
            handler: Arc::new(move |job| Box::pin(handler(job))),
            hooks: WorkerHooks::default(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Begin claiming and processing jobs in the background. A second call
    /// while running is a no-op; a stopped worker can be started again.
    pub async fn start(&self) {
        let mut guard = self.running.lock().await;

        if guard.is_some() {
            return;
        }

        // A fresh child token per run makes the worker observe queue close
        // as well as its own stop.
        let shutdown = self.inner.queue.child_shutdown_token();
        let inner = Arc::clone(&self.inner);
        let run_shutdown = shutdown.clone();

        let handle = tokio::spawn(async move {
            inner.run(run_shutdown).await;
        });

        *guard = Some((handle, shutdown));
    }

    /// Cooperative stop: resolves after the in-flight handler invocation,
    /// if any, has returned.
    pub async fn stop(&self) {
        let running = self.running.lock().await.take();

        if let Some((handle, shutdown)) = running {
            shutdown.cancel();
            let _ = handle.await;
        }
    }

    /// Process jobs of this worker's type until the pending queue is empty
    /// and no schedule of the type is due.
    ///
    /// Each pass runs an explicit maintenance tick first so due schedules
    /// are materialised before emptiness is checked. Intended for tests and
    /// graceful drains.
    pub async fn drain(&self) -> Result<()> {
        loop {
            self.inner.queue.run_maintenance().await;

            while let Some(job) = self
                .inner
                .queue
                .get_and_mark_job_as_processing(&self.inner.job_type)
                .await?
            {
                self.inner.process(job).await;
            }

            let pending = self
                .inner
                .queue
                .count_jobs(Some(&self.inner.job_type), Some(JobStatus::Pending))
                .await?;
            let due = self.inner.queue.has_due_schedule(&self.inner.job_type).await?;

            if pending == 0 && !due {
                return Ok(());
            }
        }
    }
}

/// Fluent configuration for [`Worker`].
pub struct WorkerBuilder {
    queue: Queue,
    job_type: String,
    handler: Handler,
    hooks: WorkerHooks,
    poll_interval: Duration,
}

impl WorkerBuilder {
    /// How long to sleep when no job is available. Defaults to 500 ms.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Called after a job is claimed, before the handler runs.
    pub fn on_processing(mut self, hook: impl Fn(&Job) + Send + Sync + 'static) -> Self {
        self.hooks.on_processing = Some(Box::new(hook));
        self
    }

    /// Called after a job has been marked done.
    pub fn on_completed(mut self, hook: impl Fn(&Job) + Send + Sync + 'static) -> Self {
        self.hooks.on_completed = Some(Box::new(hook));
        self
    }

    /// Called after a job has been marked failed, with the failure text.
    pub fn on_failed(mut self, hook: impl Fn(&Job, &str) + Send + Sync + 'static) -> Self {
        self.hooks.on_failed = Some(Box::new(hook));
        self
    }

    pub fn build(self) -> Worker {
        Worker {
            inner: Arc::new(WorkerInner {
                queue: self.queue,
                job_type: self.job_type,
                handler: self.handler,
                hooks: self.hooks,
                poll_interval: self.poll_interval,
            }),
            running: Mutex::new(None),
        }
    }
}
