use crate::domain::videos::{NewVideo, Video};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

pub type RepositoryResult<T> = Result<T, RepositoryError>;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("Video store unavailable: {0}")]
    Unavailable(String),

    #[error("Video {0} does not exist")]
    NotFound(u64),

    #[error("Corrupt video record: {0}")]
    Corrupt(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RepositoryError {
    /// Only an unreachable store is worth waiting for; the other errors
    /// repeat on every read.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, RepositoryError::Unavailable(_))
    }
}

#[async_trait]
pub trait VideoRepository: Send + Sync {
    /// Register an upload and assign it an id. The record starts `uploaded`.
    async fn create(&self, video: NewVideo) -> RepositoryResult<Video>;

    async fn find_by_id(&self, id: u64) -> RepositoryResult<Option<Video>>;

    /// Replace a stored record. Fails with `NotFound` instead of recreating
    /// a record that was deleted in the meantime.
    async fn update(&self, video: &Video) -> RepositoryResult<()>;

    /// Remove a record. Removing a missing id is not an error.
    async fn delete(&self, id: u64) -> RepositoryResult<()>;
}

#[async_trait]
impl<T: VideoRepository + ?Sized> VideoRepository for Arc<T> {
    async fn create(&self, video: NewVideo) -> RepositoryResult<Video> {
        (**self).create(video).await
    }

    async fn find_by_id(&self, id: u64) -> RepositoryResult<Option<Video>> {
        (**self).find_by_id(id).await
    }

    async fn update(&self, video: &Video) -> RepositoryResult<()> {
        (**self).update(video).await
    }

    async fn delete(&self, id: u64) -> RepositoryResult<()> {
        (**self).delete(id).await
    }
}
