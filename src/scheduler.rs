//! The polling loop and per-job execution.
//!
//! Each tick either dispatches one job into a free slot or, when every slot
//! is busy, backs the polling interval off. Dispatched jobs run on their own
//! tasks and never hold up the tick.

use std::any::Any;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::task::JoinError;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, Instrument};

use crate::client::Shared;
use crate::config::ProcessOptions;
use crate::error::WorkError;
use crate::job_handle::JobHandle;
use crate::store::JobStore;

/// The caller's work function.
///
/// Implemented for any `Fn(Value) -> Future<Output = anyhow::Result<Value>>`,
/// so a closure is usually enough.
#[async_trait]
pub trait JobProcessor: Send + Sync + 'static {
    async fn handle(&self, body: Value) -> anyhow::Result<Value>;
}

#[async_trait]
impl<F, Fut> JobProcessor for F
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    async fn handle(&self, body: Value) -> anyhow::Result<Value> {
        self(body).await
    }
}

/// The job a hook is being told about.
#[derive(Debug, Clone, Copy)]
pub struct JobEvent<'a> {
    pub job_id: i64,
    pub job_body: &'a Value,
    pub job_type: &'a str,
}

/// Outcome callbacks, run before the outcome is written to the table.
#[async_trait]
pub trait JobHooks: Send + Sync + 'static {
    async fn on_success(&self, _job: JobEvent<'_>, _result: &Value) {}

    async fn on_error(&self, _job: JobEvent<'_>, _error: &WorkError) {}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHooks;

impl JobHooks for NoopHooks {}

/// Current polling interval, kept between `fastest` and `slowest`.
#[derive(Debug)]
pub(crate) struct PollingRate {
    fastest: Duration,
    slowest: Duration,
    factor: f64,
    current_micros: AtomicU64,
}

impl PollingRate {
    pub fn new(fastest: Duration, slowest: Duration, factor: f64) -> Self {
        Self {
            fastest,
            slowest,
            factor,
            current_micros: AtomicU64::new(as_micros(fastest)),
        }
    }

    pub fn current(&self) -> Duration {
        Duration::from_micros(self.current_micros.load(Ordering::Acquire))
    }

    pub fn reset(&self) {
        self.current_micros
            .store(as_micros(self.fastest), Ordering::Release);
    }

    /// Multiplies the interval by the backoff factor, capped at `slowest`.
    pub fn back_off(&self) {
        let slowest = as_micros(self.slowest);
        let _ = self
            .current_micros
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |micros| {
                let next = (micros as f64 * self.factor).min(slowest as f64);
                Some(next as u64)
            });
    }
}

fn as_micros(duration: Duration) -> u64 {
    u64::try_from(duration.as_micros()).unwrap_or(u64::MAX)
}

/// Holds one concurrency slot until dropped.
struct Slot<'a>(&'a AtomicUsize);

impl Drop for Slot<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Runs `processor` on its own task and waits at most `timeout` for it.
///
/// On timeout the task is detached, not aborted: the work keeps running and
/// may still finish or cause side effects. Only the waiting stops.
pub async fn run_with_timeout(
    processor: Arc<dyn JobProcessor>,
    body: Value,
    job_id: i64,
    timeout: Duration,
) -> Result<Value, WorkError> {
    let task = tokio::spawn(async move { processor.handle(body).await });

    match tokio::time::timeout(timeout, task).await {
        Ok(Ok(Ok(value))) => Ok(value),
        Ok(Ok(Err(error))) => Err(WorkError::Failed(error)),
        Ok(Err(join_error)) => Err(WorkError::Panicked(panic_message(join_error))),
        Err(_elapsed) => Err(WorkError::TimedOut { job_id, timeout }),
    }
}

fn panic_message(error: JoinError) -> String {
    match error.try_into_panic() {
        Ok(payload) => describe_panic(payload.as_ref()),
        Err(error) => error.to_string(),
    }
}

fn describe_panic(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Ticks until `token` is cancelled.
pub(crate) async fn polling_loop<S: JobStore>(
    shared: Arc<Shared<S>>,
    processor: Arc<dyn JobProcessor>,
    hooks: Arc<dyn JobHooks>,
    options: ProcessOptions,
    token: CancellationToken,
) {
    while !token.is_cancelled() {
        if shared.in_process.load(Ordering::Acquire) < options.concurrency {
            shared.in_process.fetch_add(1, Ordering::AcqRel);

            let shared = Arc::clone(&shared);
            let processor = Arc::clone(&processor);
            let hooks = Arc::clone(&hooks);
            let token = token.clone();
            tokio::spawn(
                async move {
                    let _slot = Slot(&shared.in_process);
                    // Stopped between spawn and first poll: claim nothing.
                    if !token.is_cancelled() {
                        dispatch(&shared, processor, hooks.as_ref(), options).await;
                    }
                }
                .in_current_span(),
            );
        } else {
            shared.polling.back_off();
        }

        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = sleep(shared.polling.current()) => {}
        }
    }
    debug!(job_type = %shared.config.job_type, "Polling loop stopped");
}

/// Takes the next buffered job, runs it and records the outcome.
async fn dispatch<S: JobStore>(
    shared: &Shared<S>,
    processor: Arc<dyn JobProcessor>,
    hooks: &dyn JobHooks,
    options: ProcessOptions,
) {
    let job_type = shared.config.job_type.as_str();
    let Some(job) = shared
        .buffer
        .next_job(shared.store.as_ref(), job_type, options.concurrency)
        .await
    else {
        shared.polling.back_off();
        return;
    };
    shared.polling.reset();

    let handle = JobHandle::new(job, shared.store.as_ref());
    let job_id = handle.id();
    debug!(job.id = job_id, job_type, "Running job");

    let (body, outcome) = match handle.body() {
        Ok(body) => {
            let body = body.clone();
            let outcome =
                run_with_timeout(processor, body.clone(), job_id, options.timeout).await;
            (body, outcome)
        }
        Err(detail) => (Value::Null, Err(WorkError::MalformedBody(detail.to_string()))),
    };

    let event = JobEvent {
        job_id,
        job_body: &body,
        job_type,
    };
    let written = match outcome {
        Ok(result) => {
            hooks.on_success(event, &result).await;
            handle.complete(&result).await
        }
        Err(work_error) => {
            debug!(job.id = job_id, error = %work_error, "Job failed");
            hooks.on_error(event, &work_error).await;
            handle.fail(&work_error).await
        }
    };

    if let Err(error) = written {
        error!(job.id = job_id, %error, "Failed to record job outcome");
    }
}
