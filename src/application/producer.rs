use crate::domain::tasks::{NewTask, TaskId, TaskPolicy};
use crate::ports::queue::{QueueResult, TaskQueue};
use tracing::info;

/// Enqueues video processing tasks with a fixed policy.
pub struct TaskProducer<Q> {
    queue: Q,
    policy: TaskPolicy,
}

impl<Q: TaskQueue> TaskProducer<Q> {
    pub fn new(queue: Q, policy: TaskPolicy) -> Self {
        Self { queue, policy }
    }

    pub fn policy(&self) -> TaskPolicy {
        self.policy
    }

    pub async fn enqueue_video(&self, video_id: u64) -> QueueResult<TaskId> {
        let task_id = self
            .queue
            .enqueue(NewTask::process_video(video_id, self.policy))
            .await?;
        info!(
            video_id,
            task_id = %task_id,
            max_retry = self.policy.max_retry,
            timeout_secs = self.policy.timeout.as_secs(),
            "enqueued video processing task"
        );
        Ok(task_id)
    }
}
