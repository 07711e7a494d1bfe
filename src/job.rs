//! Job model: the unit of scheduling.
//!
//! A job is identified by a cluster-unique `id`, fires at an absolute epoch
//! time `trigger_ms`, and carries an opaque `meta` payload that is delivered
//! to its `route` when due. Jobs are encoded as JSON both on the wire and at
//! rest in the shard stores.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Milliseconds in one minute — the width of a schedule bucket.
pub const MILLIS_PER_MINUTE: i64 = 60_000;

#[derive(Error, Debug, PartialEq)]
pub enum JobError {
    #[error("invalid job id")]
    InvalidId,

    #[error("trigger_time is in the past")]
    TriggerInPast,

    #[error("invalid route")]
    InvalidRoute,

    #[error("invalid collection: {0}")]
    InvalidCollection(String),

    #[error("failed to decode job: {0}")]
    Decode(String),
}

/// Returns the current wall-clock time in epoch milliseconds.
pub fn current_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    #[serde(default)]
    pub id: String,

    /// Absolute fire time, epoch milliseconds.
    #[serde(rename = "trigger_ms", alias = "trigger_time", default)]
    pub trigger_ms: i64,

    /// Opaque payload forwarded verbatim to the route's sink.
    #[serde(default)]
    pub meta: serde_json::Value,

    /// Route id resolved against the route table at dispatch time.
    #[serde(default)]
    pub route: String,
}

impl Job {
    /// Validates the invariants required at submission time.
    pub fn validate(&self) -> Result<(), JobError> {
        if self.id.is_empty() {
            return Err(JobError::InvalidId);
        }
        if self.trigger_ms < current_millis() {
            return Err(JobError::TriggerInPast);
        }
        if self.route.is_empty() {
            return Err(JobError::InvalidRoute);
        }
        Ok(())
    }

    /// The schedule bucket this job falls into: minutes since epoch.
    pub fn minute_bucket(&self) -> i64 {
        if self.trigger_ms <= 0 {
            return 0;
        }
        self.trigger_ms / MILLIS_PER_MINUTE
    }

    /// Composite key under which this job is indexed in its minute bucket.
    ///
    /// `{collection}_{id}` — collections are validated to contain no `_`
    /// (see [`validate_collection`]) so the split on the first underscore is
    /// unambiguous even when job ids contain underscores.
    pub fn bucket_key(&self, collection: &str) -> String {
        format!("{}_{}", collection, self.id)
    }

    /// The payload bytes delivered to the sink.
    pub fn meta_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(&self.meta).unwrap_or_default()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, JobError> {
        serde_json::to_vec(self).map_err(|e| JobError::Decode(e.to_string()))
    }

    pub fn from_bytes(by: &[u8]) -> Result<Job, JobError> {
        serde_json::from_slice(by).map_err(|e| JobError::Decode(e.to_string()))
    }
}

/// Validates a client-supplied collection name.
///
/// Collections partition the key space inside a shard store and appear as
/// the prefix of composite bucket keys, so they must be non-empty and free
/// of the `_` separator.
pub fn validate_collection(collection: &str) -> Result<(), JobError> {
    if collection.is_empty() {
        return Err(JobError::InvalidCollection("empty".into()));
    }
    if collection.contains('_') {
        return Err(JobError::InvalidCollection(format!(
            "'{}' contains '_'",
            collection
        )));
    }
    Ok(())
}

/// Splits a composite bucket key back into `(collection, job_id)`.
pub fn split_bucket_key(key: &str) -> Option<(&str, &str)> {
    key.split_once('_')
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(trigger_ms: i64) -> Job {
        Job {
            id: "job-1".into(),
            trigger_ms,
            meta: serde_json::json!({"foo": "bar"}),
            route: "R1".into(),
        }
    }

    #[test]
    fn valid_job_passes() {
        let job = sample(current_millis() + 5_000);
        assert!(job.validate().is_ok());
    }

    #[test]
    fn empty_id_rejected() {
        let mut job = sample(current_millis() + 5_000);
        job.id.clear();
        assert_eq!(job.validate(), Err(JobError::InvalidId));
    }

    #[test]
    fn past_trigger_rejected() {
        let job = sample(current_millis() - 1_000);
        assert_eq!(job.validate(), Err(JobError::TriggerInPast));
    }

    #[test]
    fn empty_route_rejected() {
        let mut job = sample(current_millis() + 5_000);
        job.route.clear();
        assert_eq!(job.validate(), Err(JobError::InvalidRoute));
    }

    #[test]
    fn minute_bucket_is_minutes_since_epoch() {
        let job = sample(120_000);
        assert_eq!(job.minute_bucket(), 2);

        let job = sample(119_999);
        assert_eq!(job.minute_bucket(), 1);
    }

    #[test]
    fn serialises_roundtrip() {
        let job = sample(1_700_000_000_000);
        let by = job.to_bytes().unwrap();
        let back = Job::from_bytes(&by).unwrap();
        assert_eq!(job, back);
    }

    #[test]
    fn accepts_trigger_time_alias() {
        let job: Job =
            serde_json::from_str(r#"{"id":"a","trigger_time":42,"meta":{},"route":"r"}"#).unwrap();
        assert_eq!(job.trigger_ms, 42);
    }

    #[test]
    fn bucket_key_splits_on_first_underscore() {
        let job = Job {
            id: "order_99".into(),
            trigger_ms: 0,
            meta: serde_json::Value::Null,
            route: "r".into(),
        };
        let key = job.bucket_key("orders");
        assert_eq!(key, "orders_order_99");
        assert_eq!(split_bucket_key(&key), Some(("orders", "order_99")));
    }

    #[test]
    fn collection_validation() {
        assert!(validate_collection("orders").is_ok());
        assert!(validate_collection("").is_err());
        assert!(validate_collection("my_coll").is_err());
    }
}
