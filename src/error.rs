use crate::job::JobId;

/// Error type for queue operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The cron expression handed to `schedule` did not parse.
    #[error("invalid cron expression provided")]
    InvalidCron,

    #[error("database error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A done/failed mark hit a row that is not in the processing state.
    /// Recoverable: the row was either already terminal or requeued.
    #[error("job {0} is not processing")]
    NotProcessing(JobId),
}

pub type Result<T> = std::result::Result<T, Error>;
