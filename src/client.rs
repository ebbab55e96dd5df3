use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::claim::JobBuffer;
use crate::config::{duration_ms, ProcessOptions, QueueConfig};
use crate::enqueue::{prepare, JobSpec};
use crate::error::{ConfigurationError, QueueError};
use crate::postgres::PgJobStore;
use crate::recovery::{run_sweeper, RecoveryMode};
use crate::scheduler::{polling_loop, JobHooks, JobProcessor, NoopHooks, PollingRate};
use crate::store::JobStore;
use crate::types::JobRecord;

/// State shared between the client and the tasks it spawns.
pub(crate) struct Shared<S> {
    pub config: QueueConfig,
    pub store: Arc<S>,
    pub buffer: JobBuffer,
    pub polling: PollingRate,
    pub in_process: AtomicUsize,
}

struct RunHandle {
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

/// A point-in-time view of a client, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueState {
    pub processing: bool,
    pub in_process: usize,
    pub currently_fetching: bool,
    pub buffered: usize,
    #[serde(with = "duration_ms")]
    pub polling_rate: Duration,
}

/// A queue client for one `(job_type, table)` pair.
///
/// Any number of clients, in any number of processes, may share a table;
/// the store's atomic claim keeps them from running the same job twice.
pub struct QueueClient<S: JobStore = PgJobStore> {
    shared: Arc<Shared<S>>,
    hooks: Arc<dyn JobHooks>,
    run: Mutex<Option<RunHandle>>,
}

impl QueueClient<PgJobStore> {
    /// Connects to `config.database_url` and builds a client on it.
    pub async fn connect(config: QueueConfig) -> Result<Self, QueueError> {
        let store = PgJobStore::connect(&config).await?;
        Self::new(config, store)
    }
}

impl<S: JobStore> QueueClient<S> {
    pub fn new(config: QueueConfig, store: S) -> Result<Self, QueueError> {
        config.validate()?;

        let polling = PollingRate::new(
            config.fastest_polling_rate,
            config.slowest_polling_rate,
            config.polling_backoff_rate,
        );
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                store: Arc::new(store),
                buffer: JobBuffer::default(),
                polling,
                in_process: AtomicUsize::new(0),
            }),
            hooks: Arc::new(NoopHooks),
            run: Mutex::new(None),
        })
    }

    /// Replaces the outcome hooks. Takes effect on the next `process` call.
    pub fn with_hooks(mut self, hooks: impl JobHooks) -> Self {
        self.hooks = Arc::new(hooks);
        self
    }

    pub fn job_type(&self) -> &str {
        &self.shared.config.job_type
    }

    pub fn config(&self) -> &QueueConfig {
        &self.shared.config
    }

    pub fn store(&self) -> &S {
        &self.shared.store
    }

    pub async fn create_table(&self) -> Result<(), QueueError> {
        Ok(self.shared.store.create_table().await?)
    }

    pub async fn drop_table(&self) -> Result<(), QueueError> {
        Ok(self.shared.store.drop_table().await?)
    }

    pub async fn select_all(&self) -> Result<Vec<JobRecord>, QueueError> {
        Ok(self.shared.store.select_all().await?)
    }

    pub async fn add_job(&self, job: impl Into<JobSpec>) -> Result<u64, QueueError> {
        self.add_jobs([job.into()]).await
    }

    /// Enqueues `jobs` in a single statement.
    ///
    /// A job whose unique key is already queued is merged into the existing
    /// row rather than added. Returns the number of rows written.
    #[instrument(skip_all, err, fields(job_type = %self.shared.config.job_type))]
    pub async fn add_jobs<I>(&self, jobs: I) -> Result<u64, QueueError>
    where
        I: IntoIterator,
        I::Item: Into<JobSpec>,
    {
        let specs: Vec<JobSpec> = jobs.into_iter().map(Into::into).collect();
        if specs.is_empty() {
            return Ok(0);
        }

        let config = &self.shared.config;
        let rows = prepare(specs, &config.job_type, &config.extra_fields, Utc::now())?;
        let written = self.shared.store.insert_jobs(&rows).await?;
        debug!(submitted = rows.len(), written, "Enqueued jobs");
        Ok(written)
    }

    /// Starts polling for jobs and handing them to `processor`, along with
    /// the stuck job sweeper. Both run on the current tokio runtime until
    /// [`stop_processing`](Self::stop_processing).
    pub fn process<P: JobProcessor>(
        &self,
        processor: P,
        options: ProcessOptions,
    ) -> Result<(), QueueError> {
        options.validate()?;
        let runtime = Handle::try_current().map_err(|_| ConfigurationError::MissingRuntime)?;

        let mut run = self.run_handle();
        if run.is_some() {
            return Err(QueueError::AlreadyProcessing);
        }

        let token = CancellationToken::new();
        let config = &self.shared.config;
        self.shared.polling.reset();

        let poller = runtime.spawn(polling_loop(
            Arc::clone(&self.shared),
            Arc::new(processor),
            Arc::clone(&self.hooks),
            options,
            token.child_token(),
        ));
        let sweeper = runtime.spawn(run_sweeper(
            Arc::clone(&self.shared.store),
            config.job_type.clone(),
            RecoveryMode::from_recover_flag(options.recover_stuck_jobs),
            options.timeout,
            config.recovery_interval,
            token.child_token(),
        ));

        info!(
            job_type = %config.job_type,
            concurrency = options.concurrency,
            timeout = ?options.timeout,
            "Started processing"
        );
        *run = Some(RunHandle {
            token,
            tasks: vec![poller, sweeper],
        });
        Ok(())
    }

    /// Stops claiming new jobs. Jobs already dispatched run to completion and
    /// record their outcome; jobs still buffered wait for the next `process`.
    ///
    /// Calling this while stopped does nothing.
    pub fn stop_processing(&self) {
        let Some(run) = self.run_handle().take() else {
            return;
        };
        run.token.cancel();
        // Detached: both loops exit at their next await point.
        drop(run.tasks);
        info!(job_type = %self.shared.config.job_type, "Stopped processing");
    }

    pub fn is_processing(&self) -> bool {
        self.run_handle().is_some()
    }

    pub fn state(&self) -> QueueState {
        QueueState {
            processing: self.is_processing(),
            in_process: self.shared.in_process.load(Ordering::Acquire),
            currently_fetching: self.shared.buffer.is_fetching(),
            buffered: self.shared.buffer.len(),
            polling_rate: self.shared.polling.current(),
        }
    }

    fn run_handle(&self) -> MutexGuard<'_, Option<RunHandle>> {
        self.run.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<S: JobStore> fmt::Debug for QueueClient<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueClient")
            .field("job_type", &self.shared.config.job_type)
            .field("table", &self.shared.config.table)
            .field("state", &self.state())
            .finish()
    }
}

impl<S: JobStore> Drop for QueueClient<S> {
    fn drop(&mut self) {
        self.stop_processing();
        let abandoned = self.shared.buffer.abandon();
        if abandoned > 0 {
            warn!(
                job_type = %self.shared.config.job_type,
                abandoned,
                "Dropped buffered jobs; they stay processing until the next sweep"
            );
        }
    }
}
