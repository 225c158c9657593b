use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Current wall-clock time in milliseconds since the Unix epoch.
///
/// Every persisted instant in the store uses this resolution.
pub(crate) fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub(crate) i64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScheduledJobId(pub(crate) i64);

impl fmt::Display for ScheduledJobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Done,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
        }
    }

    pub(crate) fn from_db(status: &str) -> Self {
        match status {
            "processing" => JobStatus::Processing,
            "done" => JobStatus::Done,
            "failed" => JobStatus::Failed,
            _ => JobStatus::Pending,
        }
    }
}

/// A single unit of work.
///
/// `data` holds the serialized payload exactly as the configured serializer
/// produced it; handlers deserialize it themselves.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub job_type: String,
    pub data: String,
    pub status: JobStatus,
    pub created_at: i64,
    pub processing_at: Option<i64>,
    pub done_at: Option<i64>,
    pub failed_at: Option<i64>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduledJobStatus {
    Idle,
    Processing,
}

impl ScheduledJobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduledJobStatus::Idle => "idle",
            ScheduledJobStatus::Processing => "processing",
        }
    }

    pub(crate) fn from_db(status: &str) -> Self {
        match status {
            "processing" => ScheduledJobStatus::Processing,
            _ => ScheduledJobStatus::Idle,
        }
    }
}

/// A cron-bound template that periodically materialises a [`Job`].
///
/// At most one scheduled job exists per `job_type`; the row is `Processing`
/// only while the maintenance loop turns it into a concrete pending job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub id: ScheduledJobId,
    pub job_type: String,
    pub cron_expression: String,
    pub status: ScheduledJobStatus,
    pub next_run: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_status_round_trips_through_db_strings() {
        for status in [
            JobStatus::Pending,
            JobStatus::Processing,
            JobStatus::Done,
            JobStatus::Failed,
        ] {
            assert_eq!(JobStatus::from_db(status.as_str()), status);
        }
    }

    #[test]
    fn unknown_job_status_defaults_to_pending() {
        assert_eq!(JobStatus::from_db("garbage"), JobStatus::Pending);
    }

    #[test]
    fn scheduled_status_round_trips_through_db_strings() {
        for status in [ScheduledJobStatus::Idle, ScheduledJobStatus::Processing] {
            assert_eq!(ScheduledJobStatus::from_db(status.as_str()), status);
        }
    }
}
