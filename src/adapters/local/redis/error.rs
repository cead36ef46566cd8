//! Redis error types for the local adapter.

use crate::ports::queue::QueueError;
use crate::ports::repository::RepositoryError;
use deadpool_redis::CreatePoolError;
use thiserror::Error;

pub type RedisError = deadpool_redis::redis::RedisError;
pub type PoolError = deadpool_redis::PoolError;

#[derive(Debug, Error)]
pub enum RedisAdapterError {
    #[error("Redis error: {0}")]
    Redis(#[from] RedisError),

    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("Create pool error: {0}")]
    CreatePool(#[from] CreatePoolError),
}

impl From<RedisAdapterError> for QueueError {
    fn from(err: RedisAdapterError) -> Self {
        QueueError::Unavailable(err.to_string())
    }
}

impl From<RedisAdapterError> for RepositoryError {
    fn from(err: RedisAdapterError) -> Self {
        RepositoryError::Unavailable(err.to_string())
    }
}
