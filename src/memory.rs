use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StorageError;
use crate::store::JobStore;
use crate::types::{FetchedJob, JobRecord, JobStatus, NewJob};

/// A [`JobStore`] holding the table in process memory.
///
/// Each method runs under one lock, which gives it the same all-or-nothing
/// behaviour as a single SQL statement. Clones share the table, so several
/// clients can contend on it like separate workers on one database.
#[derive(Debug, Clone, Default)]
pub struct MemoryJobStore {
    table: Arc<Mutex<MemoryTable>>,
}

#[derive(Debug)]
struct MemoryTable {
    rows: Vec<JobRecord>,
    next_id: i64,
}

impl Default for MemoryTable {
    fn default() -> Self {
        Self {
            rows: Vec::new(),
            next_id: 1,
        }
    }
}

impl MemoryTable {
    fn processing_since(
        &mut self,
        job_type: &str,
        cutoff: Option<DateTime<Utc>>,
    ) -> impl Iterator<Item = &mut JobRecord> + '_ {
        let job_type = job_type.to_string();
        self.rows.iter_mut().filter(move |row| {
            row.job_type == job_type
                && row.status == JobStatus::Processing
                && matches!((row.started_ts, cutoff), (Some(started), Some(cutoff)) if started < cutoff)
        })
    }
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies `change` to the row with `id`, bypassing the queue protocol.
    /// Returns false when there is no such row.
    pub fn update_row(&self, id: i64, change: impl FnOnce(&mut JobRecord)) -> bool {
        let mut table = self.table();
        match table.rows.iter_mut().find(|row| row.id == id) {
            Some(row) => {
                change(row);
                true
            }
            None => false,
        }
    }

    fn table(&self) -> MutexGuard<'_, MemoryTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record_outcome(
        &self,
        id: i64,
        batch_id: i64,
        status: JobStatus,
        result: &str,
    ) -> Result<bool, StorageError> {
        let now = Utc::now();
        let mut table = self.table();
        let Some(row) = table.rows.iter_mut().find(|row| {
            row.id == id && row.batch_id == Some(batch_id) && row.status.can_transition_to(status)
        }) else {
            return Ok(false);
        };

        row.result = Some(result.to_string());
        row.unique_key = None;
        row.status = status;
        row.running_time = row
            .started_ts
            .map(|started| i32::try_from((now - started).num_seconds()).unwrap_or(i32::MAX));
        Ok(true)
    }
}

fn by_priority(a: &JobRecord, b: &JobRecord) -> Ordering {
    // NULL priorities sort last, as in Postgres.
    match (a.priority, b.priority) {
        (Some(a_priority), Some(b_priority)) => a_priority.cmp(&b_priority),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
    .then(a.id.cmp(&b.id))
}

/// Start time before which a processing row counts as stuck. `None` when
/// `older_than` reaches back past any representable time.
fn cutoff(older_than: Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(older_than)
        .ok()
        .and_then(|age| Utc::now().checked_sub_signed(age))
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create_table(&self) -> Result<(), StorageError> {
        Ok(())
    }

    async fn drop_table(&self) -> Result<(), StorageError> {
        *self.table() = MemoryTable::default();
        Ok(())
    }

    async fn select_all(&self) -> Result<Vec<JobRecord>, StorageError> {
        Ok(self.table().rows.clone())
    }

    async fn insert_jobs(&self, jobs: &[NewJob]) -> Result<u64, StorageError> {
        let mut table = self.table();
        let mut written = 0;

        for job in jobs {
            written += 1;

            let existing = job.unique_key.and_then(|key| {
                table
                    .rows
                    .iter_mut()
                    .find(|row| row.unique_key == Some(key))
            });
            if let Some(row) = existing {
                row.priority = Some(row.priority.map_or(job.priority, |p| p.min(job.priority)));
                continue;
            }

            let id = table.next_id;
            table.next_id += 1;
            table.rows.push(JobRecord {
                id,
                batch_id: None,
                job_type: job.job_type.clone(),
                created_ts: job.created_ts,
                started_ts: None,
                body: Some(job.body.clone()),
                status: JobStatus::Waiting,
                result: None,
                recovered: false,
                running_time: None,
                unique_key: job.unique_key,
                priority: Some(job.priority),
                extra: job.extra.iter().cloned().collect::<BTreeMap<_, _>>(),
            });
        }

        Ok(written)
    }

    async fn reserve_batch(
        &self,
        job_type: &str,
        batch_id: i64,
        limit: usize,
    ) -> Result<u64, StorageError> {
        let now = Utc::now();
        let mut table = self.table();

        let mut eligible: Vec<&mut JobRecord> = table
            .rows
            .iter_mut()
            .filter(|row| {
                row.batch_id.is_none()
                    && row.status == JobStatus::Waiting
                    && row.job_type == job_type
                    && row.created_ts <= now
            })
            .collect();
        eligible.sort_by(|a, b| by_priority(a, b));

        let mut reserved = 0;
        for row in eligible.into_iter().take(limit) {
            row.batch_id = Some(batch_id);
            row.status = JobStatus::Processing;
            row.started_ts = Some(now);
            reserved += 1;
        }
        Ok(reserved)
    }

    async fn fetch_batch(
        &self,
        batch_id: i64,
        limit: usize,
    ) -> Result<Vec<FetchedJob>, StorageError> {
        let table = self.table();
        let mut batch: Vec<&JobRecord> = table
            .rows
            .iter()
            .filter(|row| row.batch_id == Some(batch_id))
            .collect();
        batch.sort_by(|a, b| by_priority(a, b));

        Ok(batch
            .into_iter()
            .take(limit)
            .map(|row| FetchedJob {
                id: row.id,
                body: row.body.clone(),
            })
            .collect())
    }

    async fn complete_job(
        &self,
        id: i64,
        batch_id: i64,
        result: &str,
    ) -> Result<bool, StorageError> {
        self.record_outcome(id, batch_id, JobStatus::Success, result)
    }

    async fn fail_job(&self, id: i64, batch_id: i64, detail: &str) -> Result<bool, StorageError> {
        self.record_outcome(id, batch_id, JobStatus::Error, detail)
    }

    async fn recover_stuck(
        &self,
        job_type: &str,
        older_than: Duration,
    ) -> Result<u64, StorageError> {
        let mut table = self.table();
        let mut recovered = 0;
        for row in table.processing_since(job_type, cutoff(older_than)) {
            row.status = JobStatus::Waiting;
            row.batch_id = None;
            row.started_ts = None;
            row.recovered = true;
            recovered += 1;
        }
        Ok(recovered)
    }

    async fn mark_stuck(&self, job_type: &str, older_than: Duration) -> Result<u64, StorageError> {
        let mut table = self.table();
        let mut marked = 0;
        for row in table.processing_since(job_type, cutoff(older_than)) {
            row.status = JobStatus::Stuck;
            row.unique_key = None;
            row.recovered = true;
            marked += 1;
        }
        Ok(marked)
    }
}
