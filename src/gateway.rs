//! Bounded retry around store calls.
//!
//! This is the only place that interprets the database's error taxonomy.
//! Everything above it treats a returned [`StorageError`] as final.

use std::future::Future;
use std::io::ErrorKind;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::warn;

use crate::config::duration_ms;
use crate::error::StorageError;

/// SQLSTATEs worth another attempt: serialization failure, deadlock,
/// lock not available, admin shutdown.
const TRANSIENT_SQLSTATES: &[&str] = &["40001", "40P01", "55P03", "57P01"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    #[serde(with = "duration_ms")]
    pub min_delay: Duration,
    #[serde(with = "duration_ms")]
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            min_delay: Duration::from_millis(500),
            max_delay: Duration::from_millis(1000),
        }
    }
}

impl RetryPolicy {
    /// Runs `operation` until it succeeds, fails with a non-transient error,
    /// or runs out of attempts.
    pub async fn run<T, F, Fut>(&self, name: &'static str, mut operation: F) -> Result<T, StorageError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, sqlx::Error>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(error) if is_transient(&error) => {
                    if attempt >= max_attempts {
                        return Err(StorageError::Exhausted {
                            attempts: attempt,
                            source: error,
                        });
                    }
                    let delay = self.jittered_delay();
                    warn!(operation = name, attempt, ?delay, %error, "Transient storage error, retrying");
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(error) => return Err(StorageError::Fatal(error)),
            }
        }
    }

    fn jittered_delay(&self) -> Duration {
        let min = u64::try_from(self.min_delay.as_millis()).unwrap_or(u64::MAX);
        let max = u64::try_from(self.max_delay.as_millis()).unwrap_or(u64::MAX);
        if max <= min {
            return self.min_delay;
        }
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }
}

/// Whether `error` belongs to the fault classes that usually clear up on
/// their own: lock waits, deadlocks, dropped or refused connections.
pub fn is_transient(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Database(db_err) => {
            let code_is_transient = db_err.code().map_or(false, |code| {
                TRANSIENT_SQLSTATES.contains(&code.as_ref()) || code.starts_with("08")
            });
            code_is_transient || db_err.message().contains("try restarting transaction")
        }
        sqlx::Error::Io(io) => matches!(
            io.kind(),
            ErrorKind::TimedOut
                | ErrorKind::ConnectionRefused
                | ErrorKind::ConnectionReset
                | ErrorKind::ConnectionAborted
        ),
        sqlx::Error::PoolTimedOut => true,
        _ => false,
    }
}
