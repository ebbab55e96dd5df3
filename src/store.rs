use std::time::Duration;

use async_trait::async_trait;

use crate::error::StorageError;
use crate::types::{FetchedJob, JobRecord, NewJob};

/// Storage backend for a single job table.
///
/// Every mutating method is a single atomic statement. Cross-process mutual
/// exclusion relies on that alone: there are no multi-statement
/// transactions and no external locks.
#[async_trait]
pub trait JobStore: Send + Sync + 'static {
    async fn create_table(&self) -> Result<(), StorageError>;

    async fn drop_table(&self) -> Result<(), StorageError>;

    /// Every row in the table, ordered by id.
    async fn select_all(&self) -> Result<Vec<JobRecord>, StorageError>;

    /// Inserts `jobs` in one statement. A row whose `unique_key` already
    /// exists is merged instead: only its priority changes, to the smaller of
    /// the stored and incoming values.
    ///
    /// Returns the number of rows inserted or merged.
    async fn insert_jobs(&self, jobs: &[NewJob]) -> Result<u64, StorageError>;

    /// Reserves up to `limit` eligible `job_type` rows, lowest priority first,
    /// stamping them with `batch_id`. Eligible means waiting, unclaimed and
    /// visible (`created_ts <= now`).
    ///
    /// Returns how many rows were reserved.
    async fn reserve_batch(
        &self,
        job_type: &str,
        batch_id: i64,
        limit: usize,
    ) -> Result<u64, StorageError>;

    /// The rows carrying `batch_id`, lowest priority first.
    async fn fetch_batch(&self, batch_id: i64, limit: usize)
        -> Result<Vec<FetchedJob>, StorageError>;

    /// Records a successful outcome. Only applies while the row is still
    /// processing under `batch_id`; returns whether it did.
    async fn complete_job(&self, id: i64, batch_id: i64, result: &str)
        -> Result<bool, StorageError>;

    /// Records a failed outcome, with the same scoping as `complete_job`.
    async fn fail_job(&self, id: i64, batch_id: i64, detail: &str) -> Result<bool, StorageError>;

    /// Returns `job_type` rows processing for longer than `older_than` to the
    /// waiting pool and flags them as recovered.
    async fn recover_stuck(&self, job_type: &str, older_than: Duration)
        -> Result<u64, StorageError>;

    /// Moves `job_type` rows processing for longer than `older_than` to the
    /// terminal `stuck` state.
    async fn mark_stuck(&self, job_type: &str, older_than: Duration) -> Result<u64, StorageError>;
}
