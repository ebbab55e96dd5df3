use std::time::Duration;

use thiserror::Error;

/// Raised synchronously when a queue is built or started with bad settings.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("must specify the job type, e.g. job_type = \"weekly_emails\"")]
    MissingJobType,
    #[error("must supply a database connection (database_url)")]
    MissingConnection,
    #[error("{kind} name {name:?} is not a valid SQL identifier")]
    InvalidIdentifier { kind: &'static str, name: String },
    #[error("extra field {0:?} duplicates another column of the job table")]
    DuplicateColumn(String),
    #[error("concurrency must be at least 1")]
    InvalidConcurrency,
    #[error("job timeout must be greater than zero")]
    InvalidTimeout,
    #[error("processing must be started from within a tokio runtime")]
    MissingRuntime,
    #[error("invalid polling configuration: {0}")]
    InvalidPolling(&'static str),
    #[error("failed to parse queue configuration: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Failure reported by a [`JobStore`](crate::JobStore).
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage operation gave up after {attempts} attempts: {source}")]
    Exhausted {
        attempts: u32,
        #[source]
        source: sqlx::Error,
    },
    #[error("storage operation failed: {0}")]
    Fatal(#[from] sqlx::Error),
    #[error("unrecognized job status {0:?}")]
    InvalidStatus(String),
    #[error("failed to serialize job data: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Why a single job did not succeed. Recorded onto the row, never propagated
/// to the polling loop.
#[derive(Debug, Error)]
pub enum WorkError {
    #[error("{0:#}")]
    Failed(anyhow::Error),
    #[error("timeout for job_id {job_id} (over {} seconds)", timeout.as_secs_f64())]
    TimedOut { job_id: i64, timeout: Duration },
    #[error("job panicked: {0}")]
    Panicked(String),
    #[error("job body is not valid JSON: {0}")]
    MalformedBody(String),
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("this queue is already processing")]
    AlreadyProcessing,
}

impl From<sqlx::Error> for QueueError {
    fn from(error: sqlx::Error) -> Self {
        Self::Storage(StorageError::Fatal(error))
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(error: serde_json::Error) -> Self {
        Self::Storage(StorageError::Serialization(error))
    }
}
