use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::StorageError;
use crate::store::JobStore;

/// What the sweeper does with jobs stuck in `processing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryMode {
    /// Put them back in the waiting pool to be retried.
    #[default]
    Recover,
    /// Mark them `stuck` and leave them, for work that is unsafe to repeat.
    MarkStuck,
}

impl RecoveryMode {
    pub fn from_recover_flag(recover_stuck_jobs: bool) -> Self {
        if recover_stuck_jobs {
            Self::Recover
        } else {
            Self::MarkStuck
        }
    }
}

/// One sweep over `job_type` rows that have been processing for longer than
/// `timeout`. Returns how many rows changed.
pub async fn sweep<S: JobStore + ?Sized>(
    store: &S,
    job_type: &str,
    mode: RecoveryMode,
    timeout: Duration,
) -> Result<u64, StorageError> {
    match mode {
        RecoveryMode::Recover => store.recover_stuck(job_type, timeout).await,
        RecoveryMode::MarkStuck => store.mark_stuck(job_type, timeout).await,
    }
}

/// Sweeps every `period` until `token` is cancelled. The first sweep runs
/// one full period after start. Failures are logged and retried next period.
pub(crate) async fn run_sweeper<S: JobStore>(
    store: Arc<S>,
    job_type: String,
    mode: RecoveryMode,
    timeout: Duration,
    period: Duration,
    token: CancellationToken,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        match sweep(store.as_ref(), &job_type, mode, timeout).await {
            Ok(0) => {}
            Ok(count) => info!(job_type = %job_type, ?mode, count, "Swept stuck jobs"),
            Err(error) => error!(job_type = %job_type, ?mode, %error, "Unable to sweep stuck jobs"),
        }
    }
    debug!(job_type = %job_type, "Recovery sweeper stopped");
}
