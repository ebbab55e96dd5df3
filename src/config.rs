//! Queue configuration.
//!
//! [`QueueConfig`] holds the settings fixed for the lifetime of a
//! [`QueueClient`](crate::QueueClient); [`ProcessOptions`] holds the ones
//! chosen each time processing starts.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigurationError;
use crate::gateway::RetryPolicy;

pub const DEFAULT_TABLE: &str = "job_queue";

const MAX_IDENTIFIER_LEN: usize = 63;

/// Leaves room for the longest index suffix within the identifier limit.
const MAX_TABLE_LEN: usize = MAX_IDENTIFIER_LEN - "_next_jobs_select".len();

const BUILT_IN_COLUMNS: &[&str] = &[
    "id",
    "batch_id",
    "job_type",
    "created_ts",
    "started_ts",
    "body",
    "status",
    "result",
    "recovered",
    "running_time",
    "unique_key",
    "priority",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Logical queue partition. Every operation filters on it.
    pub job_type: String,
    pub database_url: Option<String>,
    pub table: String,
    /// Body fields mirrored into their own columns for indexed querying.
    pub extra_fields: Vec<String>,
    #[serde(with = "duration_ms")]
    pub fastest_polling_rate: Duration,
    #[serde(with = "duration_ms")]
    pub slowest_polling_rate: Duration,
    pub polling_backoff_rate: f64,
    #[serde(with = "duration_ms")]
    pub recovery_interval: Duration,
    pub retry: RetryPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            job_type: String::new(),
            database_url: None,
            table: DEFAULT_TABLE.to_string(),
            extra_fields: Vec::new(),
            fastest_polling_rate: Duration::from_millis(100),
            slowest_polling_rate: Duration::from_secs(10),
            polling_backoff_rate: 1.1,
            recovery_interval: Duration::from_secs(60),
            retry: RetryPolicy::default(),
        }
    }
}

impl QueueConfig {
    pub fn new(job_type: impl Into<String>) -> Self {
        Self {
            job_type: job_type.into(),
            ..Self::default()
        }
    }

    pub fn from_toml_str(input: &str) -> Result<Self, ConfigurationError> {
        let config: Self = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    pub fn database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = Some(url.into());
        self
    }

    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    pub fn extra_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extra_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn polling_rates(mut self, fastest: Duration, slowest: Duration) -> Self {
        self.fastest_polling_rate = fastest;
        self.slowest_polling_rate = slowest;
        self
    }

    pub fn polling_backoff_rate(mut self, factor: f64) -> Self {
        self.polling_backoff_rate = factor;
        self
    }

    pub fn recovery_interval(mut self, interval: Duration) -> Self {
        self.recovery_interval = interval;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.job_type.trim().is_empty() {
            return Err(ConfigurationError::MissingJobType);
        }
        validate_identifier("table", &self.table, MAX_TABLE_LEN)?;
        for (i, field) in self.extra_fields.iter().enumerate() {
            validate_identifier("extra field", field, MAX_IDENTIFIER_LEN)?;
            let clashes_with_column = BUILT_IN_COLUMNS
                .iter()
                .any(|column| column.eq_ignore_ascii_case(field));
            let repeated = self.extra_fields[..i]
                .iter()
                .any(|earlier| earlier.eq_ignore_ascii_case(field));
            if clashes_with_column || repeated {
                return Err(ConfigurationError::DuplicateColumn(field.clone()));
            }
        }
        if self.fastest_polling_rate.is_zero() {
            return Err(ConfigurationError::InvalidPolling(
                "fastest_polling_rate must be greater than zero",
            ));
        }
        if self.fastest_polling_rate > self.slowest_polling_rate {
            return Err(ConfigurationError::InvalidPolling(
                "fastest_polling_rate exceeds slowest_polling_rate",
            ));
        }
        if self.polling_backoff_rate.is_nan() || self.polling_backoff_rate < 1.0 {
            return Err(ConfigurationError::InvalidPolling(
                "polling_backoff_rate must be at least 1.0",
            ));
        }
        if self.recovery_interval.is_zero() {
            return Err(ConfigurationError::InvalidPolling(
                "recovery_interval must be greater than zero",
            ));
        }
        Ok(())
    }
}

/// Settings for one run of [`QueueClient::process`](crate::QueueClient::process).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessOptions {
    /// Maximum jobs in flight; also the claim batch size.
    pub concurrency: usize,
    pub timeout: Duration,
    /// Requeue stuck jobs when true, mark them `stuck` otherwise.
    pub recover_stuck_jobs: bool,
}

impl Default for ProcessOptions {
    fn default() -> Self {
        Self {
            concurrency: 3,
            timeout: Duration::from_secs(60),
            recover_stuck_jobs: true,
        }
    }
}

impl ProcessOptions {
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn recover_stuck_jobs(mut self, recover: bool) -> Self {
        self.recover_stuck_jobs = recover;
        self
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigurationError> {
        if self.concurrency == 0 {
            return Err(ConfigurationError::InvalidConcurrency);
        }
        if self.timeout.is_zero() {
            return Err(ConfigurationError::InvalidTimeout);
        }
        Ok(())
    }
}

fn validate_identifier(
    kind: &'static str,
    name: &str,
    max_len: usize,
) -> Result<(), ConfigurationError> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .map_or(false, |c| c.is_ascii_alphabetic() || c == '_');
    let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');

    if valid_start && valid_rest && name.len() <= max_len {
        Ok(())
    } else {
        Err(ConfigurationError::InvalidIdentifier {
            kind,
            name: name.to_string(),
        })
    }
}

pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let millis = u64::try_from(value.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(millis)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
