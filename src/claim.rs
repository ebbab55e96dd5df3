//! Batch claiming.
//!
//! A claim is two statements. The reserve stamps up to `batch_size` eligible
//! rows with a fresh random token in one atomic update, so no row can be
//! reserved by two claimers. The fetch then reads back exactly the rows
//! carrying that token. Reserved rows sit in a local buffer until the
//! scheduler dispatches them.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use rand::Rng;
use tracing::{debug, error};

use crate::error::StorageError;
use crate::store::JobStore;
use crate::types::ClaimedJob;

/// Jobs this process has reserved but not yet dispatched.
#[derive(Debug, Default)]
pub(crate) struct JobBuffer {
    jobs: Mutex<VecDeque<ClaimedJob>>,
    fetching: AtomicBool,
}

/// Clears the fetching flag however the refill ends.
struct FetchGuard<'a>(&'a AtomicBool);

impl Drop for FetchGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl JobBuffer {
    pub fn len(&self) -> usize {
        self.jobs().len()
    }

    pub fn is_fetching(&self) -> bool {
        self.fetching.load(Ordering::Acquire)
    }

    /// Drops every buffered job. Their rows stay `processing` until a sweep
    /// picks them up.
    pub fn abandon(&self) -> usize {
        let mut jobs = self.jobs();
        let abandoned = jobs.len();
        jobs.clear();
        abandoned
    }

    /// Pops the next job, refilling from the store first when the buffer is
    /// under `batch_size` and no other refill is running.
    ///
    /// A failed refill is logged and reads as an empty queue.
    pub async fn next_job<S: JobStore + ?Sized>(
        &self,
        store: &S,
        job_type: &str,
        batch_size: usize,
    ) -> Option<ClaimedJob> {
        if self.len() < batch_size
            && self
                .fetching
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            let _guard = FetchGuard(&self.fetching);
            if let Err(error) = self.fill(store, job_type, batch_size).await {
                error!(%error, job_type, "There was an error while trying to get the next set of jobs");
            }
        }

        self.jobs().pop_front()
    }

    async fn fill<S: JobStore + ?Sized>(
        &self,
        store: &S,
        job_type: &str,
        batch_size: usize,
    ) -> Result<usize, StorageError> {
        let batch_id = new_batch_id();

        let reserved = store.reserve_batch(job_type, batch_id, batch_size).await?;
        if reserved == 0 {
            return Ok(0);
        }

        let fetched = store.fetch_batch(batch_id, batch_size).await?;
        debug!(batch_id, reserved, fetched = fetched.len(), "Claimed job batch");

        let count = fetched.len();
        let mut jobs = self.jobs();
        jobs.extend(fetched.into_iter().map(|job| ClaimedJob {
            id: job.id,
            batch_id,
            body: serde_json::from_str(job.body.as_deref().unwrap_or("null"))
                .map_err(|err| err.to_string()),
        }));
        Ok(count)
    }

    fn jobs(&self) -> MutexGuard<'_, VecDeque<ClaimedJob>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A claim token. Positive and drawn from 63 bits, so two live batches
/// sharing one is not a practical concern.
pub(crate) fn new_batch_id() -> i64 {
    rand::thread_rng().gen_range(1..i64::MAX)
}
