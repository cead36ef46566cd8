//! Redis connection pool.

use super::error::RedisAdapterError;
use super::scripts::QueueScripts;
use super::Keys;
use deadpool_redis::{Config, Pool, Runtime};
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Redis-backed adapter for queue and repository operations.
#[derive(Clone)]
pub struct RedisPool {
    pub(super) pool: Pool,
    pub(super) keys: Keys,
    pub(super) scripts: Arc<QueueScripts>,
    pub(super) poll_interval: Duration,
}

impl RedisPool {
    /// Create a new RedisPool with connection pool. All keys live under
    /// `namespace`.
    pub fn new(redis_url: &str, namespace: &str) -> Result<Self, RedisAdapterError> {
        let cfg = Config::from_url(redis_url);
        let pool = cfg.create_pool(Some(Runtime::Tokio1))?;
        Ok(Self {
            pool,
            keys: Keys::new(namespace),
            scripts: Arc::new(QueueScripts::new()),
            poll_interval: DEFAULT_POLL_INTERVAL,
        })
    }

    /// How often an idle `receive` re-checks for due or expired tasks.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}
