//! Upload intake: register uploads, enqueue their processing, serve views.

use crate::application::producer::TaskProducer;
use crate::domain::tasks::{TaskId, TaskPolicy};
use crate::domain::videos::{original_key_for, processed_key_for, NewVideo, Video, VideoStatus};
use crate::ports::queue::{QueueError, TaskQueue};
use crate::ports::repository::{RepositoryError, VideoRepository};
use crate::ports::storage::{ObjectStore, StorageError};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum IntakeError {
    #[error("invalid upload: {0}")]
    InvalidUpload(String),

    #[error("video {0} not found")]
    NotFound(u64),

    #[error("video {0} belongs to another user")]
    Forbidden(u64),

    #[error("video {id} is {status} and can no longer be withdrawn")]
    NotWithdrawable { id: u64, status: VideoStatus },

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// An uploaded file as received from a client.
#[derive(Debug, Clone)]
pub struct Upload {
    pub owner_id: u64,
    pub title: String,
    pub file_name: String,
    pub body: Bytes,
}

#[derive(Debug, Clone)]
pub struct Submission {
    pub video: Video,
    pub task_id: TaskId,
}

/// Public representation of a video with time-limited links.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VideoView {
    pub id: u64,
    pub owner_id: u64,
    pub title: String,
    pub status: VideoStatus,
    pub original_url: Option<String>,
    pub processed_url: Option<String>,
    pub vote_count: i64,
    pub uploaded_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

pub struct IntakeService<Q, R, S> {
    producer: TaskProducer<Q>,
    videos: R,
    storage: S,
    link_ttl: Duration,
}

impl<Q, R, S> IntakeService<Q, R, S>
where
    Q: TaskQueue,
    R: VideoRepository,
    S: ObjectStore,
{
    pub fn new(queue: Q, videos: R, storage: S, policy: TaskPolicy, link_ttl: Duration) -> Self {
        Self {
            producer: TaskProducer::new(queue, policy),
            videos,
            storage,
            link_ttl,
        }
    }

    /// Store the original, register the record and enqueue its processing.
    ///
    /// If the record cannot be created the stored original is removed
    /// again. An enqueue failure is returned as is; the record stays
    /// `uploaded` and can be reissued.
    pub async fn submit(&self, upload: Upload) -> Result<Submission, IntakeError> {
        let title = upload.title.trim();
        if title.is_empty() {
            return Err(IntakeError::InvalidUpload("title is required".to_string()));
        }
        if upload.body.is_empty() {
            return Err(IntakeError::InvalidUpload("video file is empty".to_string()));
        }

        let key = original_key_for(upload.owner_id, &upload.file_name, Utc::now());
        let size = upload.body.len();
        self.storage.put(&key, upload.body).await?;

        let created = self
            .videos
            .create(NewVideo {
                owner_id: upload.owner_id,
                title: title.to_string(),
                original_key: key.clone(),
            })
            .await;
        let video = match created {
            Ok(video) => video,
            Err(e) => {
                if let Err(cleanup) = self.storage.delete(&key).await {
                    warn!(key = %key, error = %cleanup, "failed to remove orphaned upload");
                }
                return Err(e.into());
            }
        };

        let task_id = self.producer.enqueue_video(video.id).await?;
        info!(video_id = video.id, key = %key, size, "upload registered");
        Ok(Submission { video, task_id })
    }

    pub async fn view(&self, id: u64) -> Result<VideoView, IntakeError> {
        let video = self.find(id).await?;
        let original_url = self.link(&video.original_key).await;
        let processed_url = match &video.processed_key {
            Some(key) => self.link(key).await,
            None => None,
        };
        Ok(VideoView {
            id: video.id,
            owner_id: video.owner_id,
            title: video.title,
            status: video.status,
            original_url,
            processed_url,
            vote_count: video.vote_count,
            uploaded_at: video.uploaded_at,
            processed_at: video.processed_at,
        })
    }

    /// Delete a video that has not been processed yet. Only its owner may.
    pub async fn withdraw(&self, id: u64, owner_id: u64) -> Result<(), IntakeError> {
        let video = self.find(id).await?;
        if video.owner_id != owner_id {
            return Err(IntakeError::Forbidden(id));
        }
        if video.status != VideoStatus::Uploaded {
            return Err(IntakeError::NotWithdrawable {
                id,
                status: video.status,
            });
        }

        self.videos.delete(id).await?;

        // an earlier delivery may have published before the record moved
        let keys = std::iter::once(video.original_key.clone())
            .chain(processed_key_for(&video.original_key));
        for key in keys {
            if let Err(e) = self.storage.delete(&key).await {
                warn!(video_id = id, key = %key, error = %e, "failed to delete object");
            }
        }
        info!(video_id = id, "video withdrawn");
        Ok(())
    }

    /// Enqueue a fresh processing task for an existing video, e.g. after a
    /// failed enqueue or to retry a failed video.
    pub async fn reissue(&self, id: u64) -> Result<TaskId, IntakeError> {
        let video = self.find(id).await?;
        Ok(self.producer.enqueue_video(video.id).await?)
    }

    async fn find(&self, id: u64) -> Result<Video, IntakeError> {
        self.videos
            .find_by_id(id)
            .await?
            .ok_or(IntakeError::NotFound(id))
    }

    async fn link(&self, key: &str) -> Option<String> {
        match self.storage.presign_get(key, self.link_ttl).await {
            Ok(url) => Some(url),
            Err(e) => {
                warn!(key = %key, error = %e, "failed to presign link");
                None
            }
        }
    }
}
