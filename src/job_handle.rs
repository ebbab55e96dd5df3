use serde_json::Value;
use tracing::warn;

use crate::error::{StorageError, WorkError};
use crate::store::JobStore;
use crate::types::ClaimedJob;

/// A claimed job on its way to an outcome.
///
/// Consumed by [`complete`](Self::complete) or [`fail`](Self::fail), which
/// write the outcome back under the claim token.
#[derive(Debug)]
pub(crate) struct JobHandle<'a, S: JobStore + ?Sized> {
    job: ClaimedJob,
    store: &'a S,
}

impl<'a, S: JobStore + ?Sized> JobHandle<'a, S> {
    pub fn new(job: ClaimedJob, store: &'a S) -> Self {
        Self { job, store }
    }

    pub fn id(&self) -> i64 {
        self.job.id
    }

    pub fn body(&self) -> Result<&Value, &str> {
        self.job.body.as_ref().map_err(String::as_str)
    }

    pub async fn complete(self, result: &Value) -> Result<(), StorageError> {
        let result = serde_json::to_string(result)?;
        let applied = self
            .store
            .complete_job(self.job.id, self.job.batch_id, &result)
            .await?;
        if !applied {
            warn!(job.id = self.job.id, "Job was reclaimed before it finished, discarding its result");
        }
        Ok(())
    }

    pub async fn fail(self, error: &WorkError) -> Result<(), StorageError> {
        let applied = self
            .store
            .fail_job(self.job.id, self.job.batch_id, &error.to_string())
            .await?;
        if !applied {
            warn!(job.id = self.job.id, "Job was reclaimed before it failed, discarding its error");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;

    use super::*;
    use crate::memory::MemoryJobStore;
    use crate::types::{JobStatus, NewJob};

    async fn claimed(store: &MemoryJobStore) -> ClaimedJob {
        store
            .insert_jobs(&[NewJob {
                job_type: "mail".to_string(),
                body: "{}".to_string(),
                unique_key: Some(11),
                priority: 0,
                created_ts: Utc::now(),
                extra: Vec::new(),
            }])
            .await
            .unwrap();
        store.reserve_batch("mail", 5, 1).await.unwrap();
        ClaimedJob {
            id: 1,
            batch_id: 5,
            body: Ok(json!({})),
        }
    }

    #[tokio::test]
    async fn complete_stores_json_result_and_frees_the_key() {
        let store = MemoryJobStore::new();
        let job = claimed(&store).await;

        JobHandle::new(job, &store)
            .complete(&json!({"some_key": "some_value"}))
            .await
            .unwrap();

        let row = &store.select_all().await.unwrap()[0];
        assert_eq!(row.status, JobStatus::Success);
        assert_eq!(row.result.as_deref(), Some(r#"{"some_key":"some_value"}"#));
        assert_eq!(row.unique_key, None);
    }

    #[tokio::test]
    async fn fail_stores_readable_detail() {
        let store = MemoryJobStore::new();
        let job = claimed(&store).await;

        let error = WorkError::Failed(anyhow::anyhow!("upstream said no"));
        JobHandle::new(job, &store).fail(&error).await.unwrap();

        let row = &store.select_all().await.unwrap()[0];
        assert_eq!(row.status, JobStatus::Error);
        assert_eq!(row.result.as_deref(), Some("upstream said no"));
    }

    #[tokio::test]
    async fn late_outcome_for_reclaimed_job_is_dropped() {
        let store = MemoryJobStore::new();
        let job = claimed(&store).await;
        store.update_row(1, |row| {
            row.status = JobStatus::Waiting;
            row.batch_id = None;
        });

        JobHandle::new(job, &store).complete(&json!(1)).await.unwrap();

        let row = &store.select_all().await.unwrap()[0];
        assert_eq!(row.status, JobStatus::Waiting);
        assert_eq!(row.result, None);
    }
}
