use crate::domain::tasks::{NewTask, Task, TaskId};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

pub type QueueResult<T> = Result<T, QueueError>;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Queue unavailable: {0}")]
    Unavailable(String),

    /// The lease behind a `complete`/`fail` call is gone: it expired, the
    /// task was redelivered elsewhere, or it was already completed.
    #[error("Lease not found for task {0}")]
    LeaseNotFound(TaskId),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid task: {0}")]
    InvalidTask(String),
}

impl QueueError {
    pub fn is_lease_not_found(&self) -> bool {
        matches!(self, QueueError::LeaseNotFound(_))
    }
}

/// Longest span a queue schedules ahead; keeps `Instant` arithmetic in range
/// for unbounded waits and timeouts.
pub const MAX_SCHEDULE_AHEAD: Duration = Duration::from_secs(60 * 60 * 24 * 365 * 30);

/// `start + span`, clamped to [`MAX_SCHEDULE_AHEAD`].
pub fn instant_after(start: Instant, span: Duration) -> Instant {
    start + span.min(MAX_SCHEDULE_AHEAD)
}

/// At-least-once task queue with leased deliveries.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Enqueue a task and return the backend-assigned id.
    async fn enqueue(&self, task: NewTask) -> QueueResult<TaskId>;

    /// Wait up to `wait` for the next available task and lease it for the
    /// task's own timeout. `Ok(None)` when the window closes empty.
    async fn receive(&self, wait: Duration) -> QueueResult<Option<Task>>;

    /// Remove a leased task permanently.
    async fn complete(&self, task: &Task) -> QueueResult<()>;

    /// Release the lease so the task becomes deliverable again after `delay`.
    async fn fail(&self, task: &Task, delay: Duration) -> QueueResult<()>;
}

#[async_trait]
impl<T: TaskQueue + ?Sized> TaskQueue for Arc<T> {
    async fn enqueue(&self, task: NewTask) -> QueueResult<TaskId> {
        (**self).enqueue(task).await
    }

    async fn receive(&self, wait: Duration) -> QueueResult<Option<Task>> {
        (**self).receive(wait).await
    }

    async fn complete(&self, task: &Task) -> QueueResult<()> {
        (**self).complete(task).await
    }

    async fn fail(&self, task: &Task, delay: Duration) -> QueueResult<()> {
        (**self).fail(task, delay).await
    }
}
