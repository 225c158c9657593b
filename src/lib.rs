//! # durq
//!
//! A durable, embedded job queue backed by SQLite.
//!
//! ## Features
//!
//! - **Durable jobs**: enqueued work survives process restarts
//! - **Atomic claims**: any number of concurrent workers, no double dispatch
//! - **Recurring jobs**: cron-driven schedules materialise one-shot jobs
//! - **Crash recovery**: timed-out processing jobs return to the pending pool
//! - **Reaping**: aged done/failed jobs are deleted on a schedule
//! - **At-least-once**: handlers must be idempotent; that is the contract
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use durq::{Job, Queue, Worker};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct Paint {
//!     color: String,
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), durq::Error> {
//!     let queue = Queue::new("sqlite://jobs.db?mode=rwc").await?;
//!
//!     queue.add("paint", &Paint { color: "red".into() }).await?;
//!     queue.schedule("cleanup", "0 * * * *").await?;
//!
//!     let worker = Worker::new(&queue, "paint", |job: Job| async move {
//!         let paint: Paint = serde_json::from_str(&job.data).map_err(|e| e.to_string())?;
//!         println!("painting {}", paint.color);
//!         Ok(())
//!     });
//!
//!     worker.start().await;
//!
//!     // ... later
//!     worker.stop().await;
//!     queue.close().await;
//!     Ok(())
//! }
//! ```

mod cron;
mod error;
mod job;
mod maintenance;
mod queue;
mod serializer;
mod storage;
mod worker;

pub use error::{Error, Result};
pub use job::{Job, JobId, JobStatus, ScheduledJob, ScheduledJobId, ScheduledJobStatus};
pub use queue::{Queue, QueueBuilder};
pub use serializer::Serializer;
pub use worker::{Worker, WorkerBuilder};
