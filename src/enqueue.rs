//! Turning caller submissions into rows.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::StorageError;
use crate::types::NewJob;

/// One submission to the queue.
///
/// A bare JSON value converts into a `JobSpec` with no key, default priority and
/// immediate visibility.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct JobSpec {
    pub body: Value,
    /// Business key for deduplication, scoped to the job type.
    pub unique_key: Option<String>,
    /// Lower runs sooner. Defaults to the enqueue time in epoch millis.
    pub priority: Option<i64>,
    /// Earliest time the job may be claimed.
    pub start_time: Option<DateTime<Utc>>,
}

impl JobSpec {
    pub fn new(body: impl Into<Value>) -> Self {
        Self {
            body: body.into(),
            ..Self::default()
        }
    }

    pub fn from_serialize<T: Serialize>(body: &T) -> Result<Self, StorageError> {
        Ok(Self::new(serde_json::to_value(body)?))
    }

    pub fn unique_key(mut self, key: impl ToString) -> Self {
        self.unique_key = Some(key.to_string());
        self
    }

    pub fn priority(mut self, priority: i64) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn start_time(mut self, start_time: DateTime<Utc>) -> Self {
        self.start_time = Some(start_time);
        self
    }
}

impl From<Value> for JobSpec {
    fn from(body: Value) -> Self {
        Self::new(body)
    }
}

/// Dedup fingerprint for `unique_key` within `job_type`.
///
/// The first 8 bytes of `sha256("{unique_key}|{job_type}")` with the sign bit
/// cleared, so the same business key in two job types never collides.
pub fn fingerprint(unique_key: &str, job_type: &str) -> i64 {
    let digest = Sha256::digest(format!("{unique_key}|{job_type}").as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(prefix) >> 1) as i64
}

/// Builds the rows for one `add_jobs` call.
///
/// Specs sharing a fingerprint are folded into the first one, keeping the
/// smallest priority: one upsert statement may not touch the same key twice.
pub(crate) fn prepare(
    specs: Vec<JobSpec>,
    job_type: &str,
    extra_fields: &[String],
    now: DateTime<Utc>,
) -> Result<Vec<NewJob>, StorageError> {
    let default_priority = now.timestamp_millis();
    let mut rows: Vec<NewJob> = Vec::with_capacity(specs.len());
    let mut by_key: HashMap<i64, usize> = HashMap::new();

    for spec in specs {
        let unique_key = spec
            .unique_key
            .as_deref()
            .map(|key| fingerprint(key, job_type));
        let priority = spec.priority.unwrap_or(default_priority);

        if let Some(&index) = unique_key.and_then(|key| by_key.get(&key)) {
            let existing = &mut rows[index];
            existing.priority = existing.priority.min(priority);
            continue;
        }

        let extra = extra_fields
            .iter()
            .map(|field| (field.clone(), mirror_field(&spec.body, field)))
            .collect();

        if let Some(key) = unique_key {
            by_key.insert(key, rows.len());
        }
        rows.push(NewJob {
            job_type: job_type.to_string(),
            body: serde_json::to_string(&spec.body)?,
            unique_key,
            priority,
            created_ts: spec.start_time.unwrap_or(now),
            extra,
        });
    }

    Ok(rows)
}

fn mirror_field(body: &Value, field: &str) -> Option<String> {
    match body.get(field)? {
        Value::Null => None,
        Value::String(text) => Some(text.clone()),
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn fingerprint_is_stable_and_scoped_by_job_type() {
        let a = fingerprint("user-1", "emails");
        assert_eq!(a, fingerprint("user-1", "emails"));
        assert!(a >= 0);
        assert_ne!(a, fingerprint("user-1", "sms"));
        assert_ne!(a, fingerprint("user-2", "emails"));
    }

    #[test]
    fn defaults_priority_to_enqueue_millis_and_visibility_to_now() {
        let now = Utc::now();
        let rows = prepare(vec![json!({"n": 1}).into()], "emails", &[], now).unwrap();

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].priority, now.timestamp_millis());
        assert_eq!(rows[0].created_ts, now);
        assert_eq!(rows[0].unique_key, None);
        assert_eq!(rows[0].body, r#"{"n":1}"#);
    }

    #[test]
    fn explicit_priority_and_start_time_win() {
        let now = Utc::now();
        let later = now + chrono::Duration::seconds(3);
        let spec = JobSpec::new("hello").priority(-4).start_time(later);
        let rows = prepare(vec![spec], "emails", &[], now).unwrap();

        assert_eq!(rows[0].priority, -4);
        assert_eq!(rows[0].created_ts, later);
        assert_eq!(rows[0].body, r#""hello""#);
    }

    #[test]
    fn duplicate_keys_in_one_call_fold_into_the_first() {
        let rows = prepare(
            vec![
                JobSpec::new("there").unique_key("k").priority(9),
                JobSpec::new("other").unique_key("j"),
                JobSpec::new("hello").unique_key("k").priority(2),
            ],
            "emails",
            &[],
            Utc::now(),
        )
        .unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].body, r#""there""#);
        assert_eq!(rows[0].priority, 2);
        assert_eq!(rows[0].unique_key, Some(fingerprint("k", "emails")));
    }

    #[test]
    fn extra_fields_are_mirrored_as_text() {
        let extra = vec!["user_id".to_string(), "tags".to_string(), "missing".to_string()];
        let body = json!({"user_id": "u-7", "tags": ["a", "b"]});
        let rows = prepare(vec![body.into()], "emails", &extra, Utc::now()).unwrap();

        assert_eq!(
            rows[0].extra,
            vec![
                ("user_id".to_string(), Some("u-7".to_string())),
                ("tags".to_string(), Some(r#"["a","b"]"#.to_string())),
                ("missing".to_string(), None),
            ]
        );
    }

    #[test]
    fn typed_bodies_serialize_to_json() {
        #[derive(Serialize)]
        struct Resize {
            width: u32,
        }

        let spec = JobSpec::from_serialize(&Resize { width: 640 }).unwrap();
        assert_eq!(spec.body, json!({"width": 640}));
    }
}
