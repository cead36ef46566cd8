//! Redis VideoRepository implementation.

use super::error::RedisAdapterError;
use super::pool::RedisPool;
use crate::domain::videos::{NewVideo, Video};
use crate::ports::repository::{RepositoryError, RepositoryResult, VideoRepository};
use async_trait::async_trait;
use chrono::Utc;
use deadpool_redis::redis::{self, AsyncCommands};

#[async_trait]
impl VideoRepository for RedisPool {
    async fn create(&self, video: NewVideo) -> RepositoryResult<Video> {
        let mut conn = self.pool.get().await.map_err(RedisAdapterError::from)?;
        let id: u64 = conn
            .incr(self.keys.video_sequence(), 1u64)
            .await
            .map_err(RedisAdapterError::from)?;

        let video = Video::from_new(id, video, Utc::now());
        let json = serde_json::to_string(&video)?;
        conn.set::<_, _, ()>(self.keys.video(id), json)
            .await
            .map_err(RedisAdapterError::from)?;
        Ok(video)
    }

    async fn find_by_id(&self, id: u64) -> RepositoryResult<Option<Video>> {
        let mut conn = self.pool.get().await.map_err(RedisAdapterError::from)?;
        let json: Option<String> = conn
            .get(self.keys.video(id))
            .await
            .map_err(RedisAdapterError::from)?;
        match json {
            Some(data) => Ok(Some(serde_json::from_str(&data)?)),
            None => Ok(None),
        }
    }

    async fn update(&self, video: &Video) -> RepositoryResult<()> {
        let mut conn = self.pool.get().await.map_err(RedisAdapterError::from)?;
        let json = serde_json::to_string(video)?;
        // XX: never bring back a record deleted while this one was in hand
        let stored: Option<String> = redis::cmd("SET")
            .arg(self.keys.video(video.id))
            .arg(json)
            .arg("XX")
            .query_async(&mut conn)
            .await
            .map_err(RedisAdapterError::from)?;
        match stored {
            Some(_) => Ok(()),
            None => Err(RepositoryError::NotFound(video.id)),
        }
    }

    async fn delete(&self, id: u64) -> RepositoryResult<()> {
        let mut conn = self.pool.get().await.map_err(RedisAdapterError::from)?;
        conn.del::<_, ()>(self.keys.video(id))
            .await
            .map_err(RedisAdapterError::from)?;
        Ok(())
    }
}
