//! Redis TaskQueue implementation.

use super::error::RedisAdapterError;
use super::pool::RedisPool;
use crate::domain::tasks::{LeaseToken, NewTask, Task, TaskEnvelope, TaskId};
use crate::ports::queue::{
    instant_after, QueueError, QueueResult, TaskQueue, MAX_SCHEDULE_AHEAD,
};
use async_trait::async_trait;
use deadpool_redis::redis;
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;
use uuid::Uuid;

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl RedisPool {
    async fn claim(&self) -> QueueResult<Option<Task>> {
        let mut conn = self.pool.get().await.map_err(RedisAdapterError::from)?;
        let token = Uuid::new_v4().to_string();

        let mut invocation = self.scripts.claim.prepare_invoke();
        invocation
            .key(self.keys.pending())
            .key(self.keys.leases())
            .key(self.keys.scheduled())
            .arg(now_ms())
            .arg(&token)
            .arg(self.keys.task_prefix());
        let claimed: Option<(String, String, u32)> = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(RedisAdapterError::from)?;

        let Some((id, envelope, attempts)) = claimed else {
            return Ok(None);
        };
        match serde_json::from_str::<TaskEnvelope>(&envelope) {
            Ok(envelope) => Ok(Some(envelope.into_task(
                TaskId::new(id),
                attempts,
                LeaseToken::new(token),
            ))),
            Err(e) => {
                warn!(task_id = %id, error = %e, "dropping task with unreadable envelope");
                let _: () = redis::pipe()
                    .atomic()
                    .zrem(self.keys.leases(), &id)
                    .ignore()
                    .del(self.keys.task(&id))
                    .ignore()
                    .query_async(&mut conn)
                    .await
                    .map_err(RedisAdapterError::from)?;
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl TaskQueue for RedisPool {
    async fn enqueue(&self, task: NewTask) -> QueueResult<TaskId> {
        let mut conn = self.pool.get().await.map_err(RedisAdapterError::from)?;
        let id = Uuid::new_v4().to_string();
        let envelope = serde_json::to_string(&TaskEnvelope::from_new(&task))?;
        let timeout_ms = task.timeout.min(MAX_SCHEDULE_AHEAD).as_millis().to_string();

        let _: () = redis::pipe()
            .atomic()
            .hset_multiple(
                self.keys.task(&id),
                &[
                    ("envelope", envelope.as_str()),
                    ("timeout_ms", timeout_ms.as_str()),
                    ("attempts", "0"),
                ],
            )
            .ignore()
            .lpush(self.keys.pending(), &id)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(RedisAdapterError::from)?;
        Ok(TaskId::new(id))
    }

    async fn receive(&self, wait: Duration) -> QueueResult<Option<Task>> {
        let deadline = instant_after(Instant::now(), wait);
        loop {
            if let Some(task) = self.claim().await? {
                return Ok(Some(task));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    async fn complete(&self, task: &Task) -> QueueResult<()> {
        let mut conn = self.pool.get().await.map_err(RedisAdapterError::from)?;
        let mut invocation = self.scripts.complete.prepare_invoke();
        invocation
            .key(self.keys.leases())
            .arg(self.keys.task(task.id.as_str()))
            .arg(task.id.as_str())
            .arg(task.lease.as_str())
            .arg(now_ms());
        let completed: i64 = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(RedisAdapterError::from)?;

        if completed == 1 {
            Ok(())
        } else {
            Err(QueueError::LeaseNotFound(task.id.clone()))
        }
    }

    async fn fail(&self, task: &Task, delay: Duration) -> QueueResult<()> {
        let mut conn = self.pool.get().await.map_err(RedisAdapterError::from)?;
        let now = now_ms();
        let ready_at = now.saturating_add(delay.as_millis().min(i64::MAX as u128) as i64);

        let mut invocation = self.scripts.fail.prepare_invoke();
        invocation
            .key(self.keys.leases())
            .key(self.keys.scheduled())
            .key(self.keys.pending())
            .arg(self.keys.task(task.id.as_str()))
            .arg(task.id.as_str())
            .arg(task.lease.as_str())
            .arg(now)
            .arg(ready_at);
        let released: i64 = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(RedisAdapterError::from)?;

        if released == 1 {
            Ok(())
        } else {
            Err(QueueError::LeaseNotFound(task.id.clone()))
        }
    }
}

/// These run against a live server and are skipped unless `REDIS_URL` is set.
#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::tasks::TaskPolicy;

    fn queue() -> Option<RedisPool> {
        let url = std::env::var("REDIS_URL").ok()?;
        let namespace = format!("reelworks-test:{}", Uuid::new_v4().simple());
        Some(
            RedisPool::new(&url, &namespace)
                .unwrap()
                .with_poll_interval(Duration::from_millis(5)),
        )
    }

    fn policy(timeout: Duration) -> TaskPolicy {
        TaskPolicy {
            max_retry: 3,
            timeout,
        }
    }

    #[tokio::test]
    async fn test_lease_is_exclusive() {
        let Some(queue) = queue() else { return };
        queue
            .enqueue(NewTask::process_video(1, policy(Duration::from_secs(60))))
            .await
            .unwrap();

        let (a, b) = tokio::join!(
            queue.receive(Duration::from_millis(50)),
            queue.receive(Duration::from_millis(50))
        );
        let delivered: Vec<Task> = [a.unwrap(), b.unwrap()].into_iter().flatten().collect();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].delivery_attempt, 1);
        assert_eq!(delivered[0].payload["video_id"], 1);
    }

    #[tokio::test]
    async fn test_complete_twice_reports_lost_lease() {
        let Some(queue) = queue() else { return };
        queue
            .enqueue(NewTask::process_video(1, policy(Duration::from_secs(60))))
            .await
            .unwrap();
        let task = queue.receive(Duration::ZERO).await.unwrap().unwrap();

        queue.complete(&task).await.unwrap();
        assert!(queue.complete(&task).await.unwrap_err().is_lease_not_found());
        assert!(queue
            .receive(Duration::from_millis(20))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_expired_lease_is_redelivered_and_old_holder_rejected() {
        let Some(queue) = queue() else { return };
        let id = queue
            .enqueue(NewTask::process_video(1, policy(Duration::from_millis(50))))
            .await
            .unwrap();
        let first = queue.receive(Duration::ZERO).await.unwrap().unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(queue
            .fail(&first, Duration::ZERO)
            .await
            .unwrap_err()
            .is_lease_not_found());

        let second = queue
            .receive(Duration::from_millis(200))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.id, id);
        assert_eq!(second.delivery_attempt, 2);
        assert_ne!(second.lease, first.lease);

        assert!(queue.complete(&first).await.unwrap_err().is_lease_not_found());
        queue.complete(&second).await.unwrap();
    }

    #[tokio::test]
    async fn test_delayed_release_hides_task_until_ready() {
        let Some(queue) = queue() else { return };
        queue
            .enqueue(NewTask::process_video(1, policy(Duration::from_secs(60))))
            .await
            .unwrap();
        let task = queue.receive(Duration::ZERO).await.unwrap().unwrap();
        queue.fail(&task, Duration::from_millis(150)).await.unwrap();

        assert!(queue
            .receive(Duration::from_millis(20))
            .await
            .unwrap()
            .is_none());
        let later = queue
            .receive(Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(later.delivery_attempt, 2);
    }

    #[tokio::test]
    async fn test_immediate_release_is_redelivered() {
        let Some(queue) = queue() else { return };
        queue
            .enqueue(NewTask::process_video(4, policy(Duration::from_secs(60))))
            .await
            .unwrap();
        let first = queue.receive(Duration::ZERO).await.unwrap().unwrap();
        queue.fail(&first, Duration::ZERO).await.unwrap();

        let second = queue.receive(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(second.delivery_attempt, 2);
        assert_eq!(second.payload["video_id"], 4);
    }
}
