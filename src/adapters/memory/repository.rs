use crate::domain::videos::{NewVideo, Video};
use crate::ports::repository::{RepositoryError, RepositoryResult, VideoRepository};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Default)]
struct Records {
    last_id: u64,
    videos: HashMap<u64, Video>,
}

/// In-memory video records. Cloning shares the same records.
#[derive(Clone, Default)]
pub struct MemoryVideoStore {
    inner: Arc<Mutex<Records>>,
}

impl MemoryVideoStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a record with a caller-chosen id.
    pub async fn insert(&self, video: Video) {
        let mut records = self.inner.lock().await;
        records.last_id = records.last_id.max(video.id);
        records.videos.insert(video.id, video);
    }
}

#[async_trait]
impl VideoRepository for MemoryVideoStore {
    async fn create(&self, video: NewVideo) -> RepositoryResult<Video> {
        let mut records = self.inner.lock().await;
        records.last_id += 1;
        let video = Video::from_new(records.last_id, video, Utc::now());
        records.videos.insert(video.id, video.clone());
        Ok(video)
    }

    async fn find_by_id(&self, id: u64) -> RepositoryResult<Option<Video>> {
        Ok(self.inner.lock().await.videos.get(&id).cloned())
    }

    async fn update(&self, video: &Video) -> RepositoryResult<()> {
        match self.inner.lock().await.videos.get_mut(&video.id) {
            Some(stored) => {
                *stored = video.clone();
                Ok(())
            }
            None => Err(RepositoryError::NotFound(video.id)),
        }
    }

    async fn delete(&self, id: u64) -> RepositoryResult<()> {
        self.inner.lock().await.videos.remove(&id);
        Ok(())
    }
}
