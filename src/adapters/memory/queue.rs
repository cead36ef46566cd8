//! In-memory `TaskQueue` with leases, delivery counting and delayed release.

use crate::domain::tasks::{LeaseToken, NewTask, Task, TaskEnvelope, TaskId};
use crate::ports::queue::{instant_after, QueueError, QueueResult, TaskQueue};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use uuid::Uuid;

struct Lease {
    token: LeaseToken,
    expires_at: Instant,
}

struct Entry {
    envelope: TaskEnvelope,
    attempts: u32,
    ready_at: Instant,
    lease: Option<Lease>,
}

impl Entry {
    /// Ready and either never leased or the lease ran out.
    fn claimable(&self, now: Instant) -> bool {
        self.ready_at <= now && self.lease.as_ref().map_or(true, |l| l.expires_at <= now)
    }

    fn next_change(&self, now: Instant) -> Option<Instant> {
        match &self.lease {
            Some(lease) => Some(lease.expires_at),
            None if self.ready_at > now => Some(self.ready_at),
            None => None,
        }
    }
}

#[derive(Default)]
struct State {
    order: VecDeque<TaskId>,
    entries: HashMap<TaskId, Entry>,
}

impl State {
    fn claim(&mut self, now: Instant) -> Option<Task> {
        let pos = self
            .order
            .iter()
            .position(|id| self.entries.get(id).map_or(false, |e| e.claimable(now)))?;
        let id = self.order.remove(pos)?;
        // rotate so a task that keeps coming back does not starve the rest
        self.order.push_back(id.clone());

        let entry = self.entries.get_mut(&id)?;
        entry.attempts += 1;
        let token = LeaseToken::new(Uuid::new_v4().to_string());
        entry.lease = Some(Lease {
            token: token.clone(),
            expires_at: instant_after(now, entry.envelope.timeout()),
        });
        Some(entry.envelope.clone().into_task(id, entry.attempts, token))
    }

    fn next_change(&self, now: Instant) -> Option<Instant> {
        self.entries.values().filter_map(|e| e.next_change(now)).min()
    }

    fn held(&mut self, task: &Task, now: Instant) -> QueueResult<&mut Entry> {
        let entry = self
            .entries
            .get_mut(&task.id)
            .ok_or_else(|| QueueError::LeaseNotFound(task.id.clone()))?;
        let held = matches!(
            &entry.lease,
            Some(lease) if lease.token == task.lease && lease.expires_at > now
        );
        if held {
            Ok(entry)
        } else {
            Err(QueueError::LeaseNotFound(task.id.clone()))
        }
    }
}

#[derive(Default)]
struct Shared {
    state: Mutex<State>,
    notify: Notify,
}

/// Cloning shares the same queue.
#[derive(Clone, Default)]
pub struct MemoryQueue {
    inner: Arc<Shared>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tasks not yet completed, leased or not.
    pub async fn len(&self) -> usize {
        self.inner.state.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Deliveries made so far for a task still in the queue.
    pub async fn attempts(&self, id: &TaskId) -> Option<u32> {
        self.inner
            .state
            .lock()
            .await
            .entries
            .get(id)
            .map(|e| e.attempts)
    }
}

#[async_trait]
impl TaskQueue for MemoryQueue {
    async fn enqueue(&self, task: NewTask) -> QueueResult<TaskId> {
        let id = TaskId::new(Uuid::new_v4().to_string());
        {
            let mut state = self.inner.state.lock().await;
            state.entries.insert(
                id.clone(),
                Entry {
                    envelope: TaskEnvelope::from_new(&task),
                    attempts: 0,
                    ready_at: Instant::now(),
                    lease: None,
                },
            );
            state.order.push_back(id.clone());
        }
        self.inner.notify.notify_one();
        Ok(id)
    }

    async fn receive(&self, wait: Duration) -> QueueResult<Option<Task>> {
        let deadline = instant_after(Instant::now(), wait);
        loop {
            let wake_at = {
                let mut state = self.inner.state.lock().await;
                let now = Instant::now();
                if let Some(task) = state.claim(now) {
                    return Ok(Some(task));
                }
                if now >= deadline {
                    return Ok(None);
                }
                state
                    .next_change(now)
                    .map_or(deadline, |at| at.min(deadline))
            };

            tokio::select! {
                _ = self.inner.notify.notified() => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn complete(&self, task: &Task) -> QueueResult<()> {
        let mut state = self.inner.state.lock().await;
        state.held(task, Instant::now())?;
        state.entries.remove(&task.id);
        state.order.retain(|id| id != &task.id);
        Ok(())
    }

    async fn fail(&self, task: &Task, delay: Duration) -> QueueResult<()> {
        {
            let mut state = self.inner.state.lock().await;
            let now = Instant::now();
            let entry = state.held(task, now)?;
            entry.lease = None;
            entry.ready_at = instant_after(now, delay);
        }
        self.inner.notify.notify_one();
        Ok(())
    }
}
