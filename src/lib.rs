//! A durable job queue on a single PostgreSQL table.
//!
//! Producers enqueue JSON jobs with [`QueueClient::add_jobs`]; workers call
//! [`QueueClient::process`] and receive them in priority order. Workers in
//! separate processes share the table safely: each claim reserves a batch of
//! rows in one atomic statement, so no job is handed out twice. Jobs left in
//! `processing` by a crashed worker are requeued, or marked `stuck`, by a
//! periodic sweep.
//!
//! ```no_run
//! use serde_json::{json, Value};
//! use tablequeue::{JobSpec, ProcessOptions, QueueClient, QueueConfig};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = QueueConfig::new("emails").database_url("postgres://localhost/jobs");
//! let queue = QueueClient::connect(config).await?;
//! queue.create_table().await?;
//!
//! queue
//!     .add_job(JobSpec::new(json!({"to": "a@example.com"})).unique_key("welcome-a"))
//!     .await?;
//!
//! queue.process(
//!     |body: Value| async move { Ok::<_, anyhow::Error>(json!({"sent": body["to"]})) },
//!     ProcessOptions::default(),
//! )?;
//! # Ok(())
//! # }
//! ```

mod claim;
mod client;
mod config;
mod enqueue;
mod error;
mod gateway;
mod job_handle;
mod memory;
mod postgres;
mod recovery;
mod schema;
mod scheduler;
mod store;
mod types;

pub use client::{QueueClient, QueueState};
pub use config::{ProcessOptions, QueueConfig, DEFAULT_TABLE};
pub use enqueue::{fingerprint, JobSpec};
pub use error::{ConfigurationError, QueueError, StorageError, WorkError};
pub use gateway::{is_transient, RetryPolicy};
pub use memory::MemoryJobStore;
pub use postgres::PgJobStore;
pub use recovery::{sweep, RecoveryMode};
pub use scheduler::{run_with_timeout, JobEvent, JobHooks, JobProcessor, NoopHooks};
pub use store::JobStore;
pub use types::{FetchedJob, JobRecord, JobStatus, NewJob};
