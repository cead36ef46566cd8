use async_trait::async_trait;
use std::io;
use std::path::PathBuf;
use std::process::{Output, Stdio};
use tokio::process::Command as TokioCommand;

/// Runs one ffmpeg invocation and captures its output.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FfmpegExecutor: Send + Sync {
    async fn run_ffmpeg(&self, args: Vec<String>) -> io::Result<Output>;
}

pub struct RealFfmpegExecutor {
    binary: PathBuf,
}

impl RealFfmpegExecutor {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl Default for RealFfmpegExecutor {
    fn default() -> Self {
        Self::new("ffmpeg")
    }
}

#[async_trait]
impl FfmpegExecutor for RealFfmpegExecutor {
    async fn run_ffmpeg(&self, args: Vec<String>) -> io::Result<Output> {
        TokioCommand::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            // the child dies with the future when a deadline cancels it
            .kill_on_drop(true)
            .output()
            .await
    }
}
