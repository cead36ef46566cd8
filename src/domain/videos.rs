//! Video records and the status machine the worker drives.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

/// Prefix under which derived artifacts are published.
pub const PROCESSED_PREFIX: &str = "processed/";

/// Prefix under which uploads are stored.
pub const ORIGINALS_PREFIX: &str = "originals/";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoStatus {
    Uploaded,
    Processed,
    Failed,
}

impl VideoStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VideoStatus::Uploaded => "uploaded",
            VideoStatus::Processed => "processed",
            VideoStatus::Failed => "failed",
        }
    }

    /// Allowed transitions. A processed video never regresses to failed and
    /// nothing returns to uploaded. A failed video may still be processed by
    /// a freshly enqueued task.
    pub fn can_become(self, next: VideoStatus) -> bool {
        use VideoStatus::*;
        matches!(
            (self, next),
            (Uploaded, Processed)
                | (Uploaded, Failed)
                | (Processed, Processed)
                | (Failed, Failed)
                | (Failed, Processed)
        )
    }
}

impl fmt::Display for VideoStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VideoStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "uploaded" => Ok(VideoStatus::Uploaded),
            "processed" => Ok(VideoStatus::Processed),
            "failed" => Ok(VideoStatus::Failed),
            other => Err(format!("unknown video status '{}'", other)),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("video {video_id} cannot move from {from} to {to}")]
pub struct TransitionError {
    pub video_id: u64,
    pub from: VideoStatus,
    pub to: VideoStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Video {
    pub id: u64,
    pub owner_id: u64,
    pub title: String,
    pub status: VideoStatus,
    pub original_key: String,
    pub processed_key: Option<String>,
    pub vote_count: i64,
    pub uploaded_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

/// Fields supplied when registering an upload.
#[derive(Debug, Clone, PartialEq)]
pub struct NewVideo {
    pub owner_id: u64,
    pub title: String,
    pub original_key: String,
}

impl Video {
    pub fn from_new(id: u64, new: NewVideo, uploaded_at: DateTime<Utc>) -> Self {
        Self {
            id,
            owner_id: new.owner_id,
            title: new.title,
            status: VideoStatus::Uploaded,
            original_key: new.original_key,
            processed_key: None,
            vote_count: 0,
            uploaded_at,
            processed_at: None,
        }
    }

    /// Record the published artifact. Every status may become processed, so
    /// this never fails; re-marking an already processed video just refreshes
    /// the timestamp.
    pub fn mark_processed(&mut self, processed_key: String, at: DateTime<Utc>) {
        self.status = VideoStatus::Processed;
        self.processed_key = Some(processed_key);
        self.processed_at = Some(at);
    }

    /// Record a terminal failure and drop any processed reference.
    pub fn mark_failed(&mut self) -> Result<(), TransitionError> {
        if !self.status.can_become(VideoStatus::Failed) {
            return Err(TransitionError {
                video_id: self.id,
                from: self.status,
                to: VideoStatus::Failed,
            });
        }
        self.status = VideoStatus::Failed;
        self.processed_key = None;
        self.processed_at = None;
        Ok(())
    }
}

/// Base name of the derived artifact: the final path segment of the original
/// key without its extension.
pub fn derived_base_name(original_key: &str) -> Option<String> {
    let stem = Path::new(original_key).file_stem()?.to_str()?;
    if stem.is_empty() {
        return None;
    }
    Some(stem.to_string())
}

/// Deterministic destination key of the processed artifact, so reprocessing
/// the same video overwrites the same object.
pub fn processed_key_for(original_key: &str) -> Option<String> {
    derived_base_name(original_key).map(|base| format!("{}{}.mp4", PROCESSED_PREFIX, base))
}

/// Storage key for a new upload: `originals/<unix nanos>-<owner><.ext>`.
pub fn original_key_for(owner_id: u64, file_name: &str, at: DateTime<Utc>) -> String {
    let nanos = at
        .timestamp_nanos_opt()
        .unwrap_or_else(|| at.timestamp_micros().saturating_mul(1000));
    let ext = Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .filter(|e| !e.is_empty() && e.chars().all(|c| c.is_ascii_alphanumeric()))
        .map(|e| format!(".{}", e.to_ascii_lowercase()))
        .unwrap_or_default();
    format!("{}{}-{}{}", ORIGINALS_PREFIX, nanos, owner_id, ext)
}
