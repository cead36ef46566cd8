use crate::domain::videos::{NewVideo, Video};
use crate::ports::repository::{RepositoryError, RepositoryResult, VideoRepository};
use async_trait::async_trait;
use aws_sdk_dynamodb::error::DisplayErrorContext;
use aws_sdk_dynamodb::types::{AttributeValue, ReturnValue};
use aws_sdk_dynamodb::Client;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::str::FromStr;

/// Partition key of every item.
const KEY: &str = "video_id";
/// Item under `video_id = 0` holding the id sequence.
const SEQUENCE_ITEM: &str = "0";

type Item = HashMap<String, AttributeValue>;

/// DynamoAdapter implements VideoRepository for AWS DynamoDB.
#[derive(Clone)]
pub struct DynamoAdapter {
    client: Client,
    table_name: String,
}

impl DynamoAdapter {
    pub fn new(client: Client, table_name: String) -> Self {
        Self { client, table_name }
    }

    async fn next_id(&self) -> RepositoryResult<u64> {
        let resp = self
            .client
            .update_item()
            .table_name(&self.table_name)
            .key(KEY, AttributeValue::N(SEQUENCE_ITEM.to_string()))
            .update_expression("ADD next_id :one")
            .expression_attribute_values(":one", AttributeValue::N("1".to_string()))
            .return_values(ReturnValue::UpdatedNew)
            .send()
            .await
            .map_err(unavailable)?;

        resp.attributes()
            .and_then(|attrs| attrs.get("next_id"))
            .and_then(|v| v.as_n().ok())
            .and_then(|n| n.parse().ok())
            .ok_or_else(|| RepositoryError::Corrupt("id sequence returned no value".to_string()))
    }
}

#[async_trait]
impl VideoRepository for DynamoAdapter {
    async fn create(&self, video: NewVideo) -> RepositoryResult<Video> {
        let id = self.next_id().await?;
        let video = Video::from_new(id, video, Utc::now());

        self.client
            .put_item()
            .table_name(&self.table_name)
            .set_item(Some(to_item(&video)))
            .condition_expression("attribute_not_exists(video_id)")
            .send()
            .await
            .map_err(unavailable)?;
        Ok(video)
    }

    async fn find_by_id(&self, id: u64) -> RepositoryResult<Option<Video>> {
        if id == 0 {
            return Ok(None);
        }
        let resp = self
            .client
            .get_item()
            .table_name(&self.table_name)
            .key(KEY, AttributeValue::N(id.to_string()))
            .consistent_read(true)
            .send()
            .await
            .map_err(unavailable)?;

        resp.item().map(from_item).transpose()
    }

    async fn update(&self, video: &Video) -> RepositoryResult<()> {
        self.client
            .put_item()
            .table_name(&self.table_name)
            .set_item(Some(to_item(video)))
            .condition_expression("attribute_exists(video_id)")
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error()
                    .map_or(false, |se| se.is_conditional_check_failed_exception())
                {
                    RepositoryError::NotFound(video.id)
                } else {
                    unavailable(e)
                }
            })?;
        Ok(())
    }

    async fn delete(&self, id: u64) -> RepositoryResult<()> {
        self.client
            .delete_item()
            .table_name(&self.table_name)
            .key(KEY, AttributeValue::N(id.to_string()))
            .send()
            .await
            .map_err(unavailable)?;
        Ok(())
    }
}

fn to_item(video: &Video) -> Item {
    let mut item = Item::new();
    item.insert(KEY.to_string(), AttributeValue::N(video.id.to_string()));
    item.insert("owner_id".to_string(), AttributeValue::N(video.owner_id.to_string()));
    item.insert("title".to_string(), AttributeValue::S(video.title.clone()));
    item.insert(
        "status".to_string(),
        AttributeValue::S(video.status.as_str().to_string()),
    );
    item.insert(
        "original_key".to_string(),
        AttributeValue::S(video.original_key.clone()),
    );
    item.insert(
        "vote_count".to_string(),
        AttributeValue::N(video.vote_count.to_string()),
    );
    item.insert(
        "uploaded_at".to_string(),
        AttributeValue::S(video.uploaded_at.to_rfc3339()),
    );
    if let Some(key) = &video.processed_key {
        item.insert("processed_key".to_string(), AttributeValue::S(key.clone()));
    }
    if let Some(at) = &video.processed_at {
        item.insert("processed_at".to_string(), AttributeValue::S(at.to_rfc3339()));
    }
    item
}

fn from_item(item: &Item) -> RepositoryResult<Video> {
    Ok(Video {
        id: number(item, KEY)?,
        owner_id: number(item, "owner_id")?,
        title: string(item, "title")?,
        status: parse(item, "status", string(item, "status")?)?,
        original_key: string(item, "original_key")?,
        processed_key: optional_string(item, "processed_key"),
        vote_count: number(item, "vote_count")?,
        uploaded_at: timestamp(item, "uploaded_at", &string(item, "uploaded_at")?)?,
        processed_at: optional_string(item, "processed_at")
            .map(|raw| timestamp(item, "processed_at", &raw))
            .transpose()?,
    })
}

fn optional_string(item: &Item, name: &str) -> Option<String> {
    item.get(name).and_then(|v| v.as_s().ok()).cloned()
}

fn string(item: &Item, name: &str) -> RepositoryResult<String> {
    optional_string(item, name).ok_or_else(|| corrupt(item, name, "missing string"))
}

fn number<T: FromStr>(item: &Item, name: &str) -> RepositoryResult<T> {
    let raw = item
        .get(name)
        .and_then(|v| v.as_n().ok())
        .ok_or_else(|| corrupt(item, name, "missing number"))?;
    parse(item, name, raw.clone())
}

fn parse<T: FromStr>(item: &Item, name: &str, raw: String) -> RepositoryResult<T> {
    raw.parse()
        .map_err(|_| corrupt(item, name, &format!("unparsable value '{}'", raw)))
}

fn timestamp(item: &Item, name: &str, raw: &str) -> RepositoryResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| corrupt(item, name, &e.to_string()))
}

fn corrupt(item: &Item, name: &str, reason: &str) -> RepositoryError {
    let id = item
        .get(KEY)
        .and_then(|v| v.as_n().ok())
        .map(String::as_str)
        .unwrap_or("?");
    RepositoryError::Corrupt(format!("video {} attribute {}: {}", id, name, reason))
}

fn unavailable<E: std::error::Error>(err: E) -> RepositoryError {
    RepositoryError::Unavailable(DisplayErrorContext(err).to_string())
}
