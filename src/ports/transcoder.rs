use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

/// Step names carried by [`TranscodeError`].
pub const TRIM_STEP: &str = "trim+scale";
pub const CONCAT_STEP: &str = "concat";

#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error("{step} could not be started: {source}")]
    Spawn {
        step: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("{step} exited with {status}: {stderr}")]
    Failed {
        step: &'static str,
        status: String,
        stderr: String,
    },

    #[error("{step} did not finish before the task deadline")]
    TimedOut { step: &'static str },

    #[error("{step} produced no output at {}", path.display())]
    MissingOutput { step: &'static str, path: PathBuf },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Parameters of the trim and normalize step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrimScaleOptions {
    pub max_duration: Duration,
    pub width: u32,
    pub height: u32,
    /// Display aspect ratio in ffmpeg `setdar` form, e.g. `16/9`.
    pub aspect: String,
    pub preset: String,
}

impl Default for TrimScaleOptions {
    fn default() -> Self {
        Self {
            max_duration: Duration::from_secs(30),
            width: 1280,
            height: 720,
            aspect: "16/9".to_string(),
            preset: "fast".to_string(),
        }
    }
}

#[async_trait]
pub trait Transcoder: Send + Sync {
    /// Cut `input` to at most `max_duration` and normalize its frame size and
    /// aspect ratio into `output`.
    async fn trim_and_scale(
        &self,
        input: &Path,
        output: &Path,
        options: &TrimScaleOptions,
        deadline: Option<Instant>,
    ) -> Result<(), TranscodeError>;

    /// Stream-copy `parts` back to back into `output`.
    async fn concat(
        &self,
        parts: &[PathBuf],
        output: &Path,
        deadline: Option<Instant>,
    ) -> Result<(), TranscodeError>;
}

#[async_trait]
impl<T: Transcoder + ?Sized> Transcoder for Arc<T> {
    async fn trim_and_scale(
        &self,
        input: &Path,
        output: &Path,
        options: &TrimScaleOptions,
        deadline: Option<Instant>,
    ) -> Result<(), TranscodeError> {
        (**self).trim_and_scale(input, output, options, deadline).await
    }

    async fn concat(
        &self,
        parts: &[PathBuf],
        output: &Path,
        deadline: Option<Instant>,
    ) -> Result<(), TranscodeError> {
        (**self).concat(parts, output, deadline).await
    }
}
