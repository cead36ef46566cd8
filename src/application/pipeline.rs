//! The two-step transcoding sequence run for every video.

use crate::ports::transcoder::{
    TranscodeError, Transcoder, TrimScaleOptions, CONCAT_STEP, TRIM_STEP,
};
use std::path::{Path, PathBuf};
use tokio::time::Instant;

pub struct TranscodePipeline<T> {
    transcoder: T,
    intro: PathBuf,
    options: TrimScaleOptions,
}

impl<T: Transcoder> TranscodePipeline<T> {
    pub fn new(transcoder: T, intro: PathBuf, options: TrimScaleOptions) -> Self {
        Self {
            transcoder,
            intro,
            options,
        }
    }

    pub fn intro(&self) -> &Path {
        &self.intro
    }

    /// Trim and normalize `source`, then wrap it with the intro clip on both
    /// sides. Every intermediate file is written inside `scratch`; the
    /// returned path is `<scratch>/<base_name>.mp4`.
    pub async fn run(
        &self,
        source: &Path,
        scratch: &Path,
        base_name: &str,
        deadline: Option<Instant>,
    ) -> Result<PathBuf, TranscodeError> {
        let trimmed = scratch.join(format!("{}_trimmed.mp4", base_name));
        self.transcoder
            .trim_and_scale(source, &trimmed, &self.options, deadline)
            .await?;
        ensure_output(TRIM_STEP, &trimmed).await?;

        let output = scratch.join(format!("{}.mp4", base_name));
        let parts = [self.intro.clone(), trimmed, self.intro.clone()];
        self.transcoder.concat(&parts, &output, deadline).await?;
        ensure_output(CONCAT_STEP, &output).await?;

        Ok(output)
    }
}

async fn ensure_output(step: &'static str, path: &Path) -> Result<(), TranscodeError> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.len() > 0 => Ok(()),
        _ => Err(TranscodeError::MissingOutput {
            step,
            path: path.to_path_buf(),
        }),
    }
}
