//! Units of work carried by the task queue.
//!
//! A producer builds a [`NewTask`]; the queue backend stores it as a
//! [`TaskEnvelope`] and hands it back to a consumer as a leased [`Task`]
//! carrying the delivery attempt number and the lease token needed to
//! complete or fail it.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Task type tag for "transcode this uploaded video".
pub const VIDEO_PROCESS: &str = "video:process";

/// Backend-assigned task identifier (SQS message id, Redis/memory uuid).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque proof of ownership of one delivery.
///
/// For SQS this is the receipt handle; the Redis and memory backends mint a
/// fresh uuid per claim. A stale token is rejected by `complete`/`fail`.
#[derive(Clone, PartialEq, Eq)]
pub struct LeaseToken(String);

impl LeaseToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

// Receipt handles are long and not useful in logs.
impl fmt::Debug for LeaseToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix: String = self.0.chars().take(8).collect();
        write!(f, "LeaseToken({}…)", prefix)
    }
}

/// Retry ceiling and processing time limit stamped on every task a producer
/// enqueues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskPolicy {
    pub max_retry: u32,
    pub timeout: Duration,
}

impl Default for TaskPolicy {
    fn default() -> Self {
        Self {
            max_retry: 5,
            timeout: Duration::from_secs(10 * 60),
        }
    }
}

/// Payload of a [`VIDEO_PROCESS`] task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoProcessPayload {
    pub video_id: u64,
}

/// A task as submitted by a producer, before the backend assigns an id.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTask {
    pub task_type: String,
    pub payload: serde_json::Value,
    pub max_retry: u32,
    pub timeout: Duration,
}

impl NewTask {
    pub fn process_video(video_id: u64, policy: TaskPolicy) -> Self {
        Self {
            task_type: VIDEO_PROCESS.to_string(),
            payload: serde_json::json!({ "video_id": video_id }),
            max_retry: policy.max_retry,
            timeout: policy.timeout,
        }
    }

    /// Video id carried by the payload, if any. Used for backend-side
    /// message attributes.
    pub fn video_id(&self) -> Option<u64> {
        self.payload.get("video_id").and_then(|v| v.as_u64())
    }
}

/// Serialized form of a task, identical across backends.
///
/// `timeout` is in seconds and `created_at` is a unix timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub task_type: String,
    pub payload: serde_json::Value,
    pub max_retry: u32,
    pub timeout: f64,
    pub created_at: i64,
}

impl TaskEnvelope {
    pub fn from_new(task: &NewTask) -> Self {
        Self {
            task_type: task.task_type.clone(),
            payload: task.payload.clone(),
            max_retry: task.max_retry,
            timeout: task.timeout.as_secs_f64(),
            created_at: chrono::Utc::now().timestamp(),
        }
    }

    /// Processing time limit. Negative or non-finite values read as zero.
    pub fn timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.timeout).unwrap_or(Duration::ZERO)
    }

    pub fn into_task(self, id: TaskId, delivery_attempt: u32, lease: LeaseToken) -> Task {
        let timeout = self.timeout();
        Task {
            id,
            task_type: self.task_type,
            payload: self.payload,
            delivery_attempt: delivery_attempt.max(1),
            max_retry: self.max_retry,
            timeout,
            lease,
        }
    }
}

/// One leased delivery of a task.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub task_type: String,
    pub payload: serde_json::Value,
    /// 1 on first delivery, incremented on every redelivery.
    pub delivery_attempt: u32,
    pub max_retry: u32,
    pub timeout: Duration,
    pub lease: LeaseToken,
}

impl Task {
    pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.payload)
    }

    /// True once this delivery is the last one the retry ceiling allows.
    pub fn retries_exhausted(&self) -> bool {
        self.delivery_attempt >= self.max_retry
    }
}
