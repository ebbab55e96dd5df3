use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::StorageError;

/// Lifecycle state of a persisted job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Waiting,
    Processing,
    Success,
    Error,
    Stuck,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Processing => "processing",
            Self::Success => "success",
            Self::Error => "error",
            Self::Stuck => "stuck",
        }
    }

    /// Whether the engine ever moves a row from `self` to `next`.
    ///
    /// `Processing -> Waiting` is the recovery path; every other edge leaves
    /// `Processing` for a terminal state.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (Self::Waiting, Self::Processing)
                | (Self::Processing, Self::Success)
                | (Self::Processing, Self::Error)
                | (Self::Processing, Self::Waiting)
                | (Self::Processing, Self::Stuck)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Error | Self::Stuck)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(Self::Waiting),
            "processing" => Ok(Self::Processing),
            "success" => Ok(Self::Success),
            "error" => Ok(Self::Error),
            "stuck" => Ok(Self::Stuck),
            other => Err(StorageError::InvalidStatus(other.to_string())),
        }
    }
}

/// A full row of the job table, as returned by `select_all`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobRecord {
    pub id: i64,
    pub batch_id: Option<i64>,
    pub job_type: String,
    pub created_ts: DateTime<Utc>,
    pub started_ts: Option<DateTime<Utc>>,
    pub body: Option<String>,
    pub status: JobStatus,
    pub result: Option<String>,
    pub recovered: bool,
    pub running_time: Option<i32>,
    pub unique_key: Option<i64>,
    pub priority: Option<i64>,
    pub extra: BTreeMap<String, Option<String>>,
}

impl JobRecord {
    /// Decodes the stored body, if there is one.
    pub fn body_json(&self) -> Option<Result<Value, serde_json::Error>> {
        self.body.as_deref().map(serde_json::from_str)
    }
}

/// A row ready to be written by `insert_jobs`.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub job_type: String,
    pub body: String,
    pub unique_key: Option<i64>,
    pub priority: i64,
    pub created_ts: DateTime<Utc>,
    /// Values for the table's extra columns, in declaration order.
    pub extra: Vec<(String, Option<String>)>,
}

/// What the fetch half of a claim hands back: just enough to run the job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedJob {
    pub id: i64,
    pub body: Option<String>,
}

/// A job reserved for this process and waiting in the local buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimedJob {
    pub id: i64,
    pub batch_id: i64,
    pub body: Result<Value, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_text() {
        for status in [
            JobStatus::Waiting,
            JobStatus::Processing,
            JobStatus::Success,
            JobStatus::Error,
            JobStatus::Stuck,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
    }

    #[test]
    fn unknown_status_is_rejected() {
        let err = "finished".parse::<JobStatus>().unwrap_err();
        assert!(matches!(err, StorageError::InvalidStatus(s) if s == "finished"));
    }

    #[test]
    fn only_processing_rows_reach_an_outcome() {
        assert!(JobStatus::Waiting.can_transition_to(JobStatus::Processing));
        assert!(JobStatus::Processing.can_transition_to(JobStatus::Success));
        assert!(JobStatus::Processing.can_transition_to(JobStatus::Waiting));
        assert!(!JobStatus::Waiting.can_transition_to(JobStatus::Success));
        assert!(!JobStatus::Success.can_transition_to(JobStatus::Waiting));
        assert!(!JobStatus::Stuck.can_transition_to(JobStatus::Processing));
        assert!(JobStatus::Stuck.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
    }
}
