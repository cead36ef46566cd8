//! Redis adapter for local deployment.
//!
//! This module provides Redis-backed implementations of:
//! - `TaskQueue` as a reliable queue with leases, see `scripts`
//! - `VideoRepository` storing records as JSON

mod error;
mod pool;
mod queue;
mod repository;
mod scripts;

pub use error::RedisAdapterError;
pub use pool::RedisPool;

pub type RedisQueue = RedisPool;

/// Redis key layout under one namespace.
#[derive(Clone, Debug)]
pub(crate) struct Keys {
    namespace: String,
}

impl Keys {
    fn new(namespace: &str) -> Self {
        Self {
            namespace: namespace.trim_end_matches(':').to_string(),
        }
    }

    fn pending(&self) -> String {
        format!("{}:tasks:pending", self.namespace)
    }

    fn leases(&self) -> String {
        format!("{}:tasks:leases", self.namespace)
    }

    fn scheduled(&self) -> String {
        format!("{}:tasks:scheduled", self.namespace)
    }

    fn task_prefix(&self) -> String {
        format!("{}:task:", self.namespace)
    }

    fn task(&self, id: &str) -> String {
        format!("{}{}", self.task_prefix(), id)
    }

    fn video(&self, id: u64) -> String {
        format!("{}:video:{}", self.namespace, id)
    }

    fn video_sequence(&self) -> String {
        format!("{}:video:seq", self.namespace)
    }
}
