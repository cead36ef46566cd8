use super::cmd::{FfmpegExecutor, RealFfmpegExecutor};
use crate::ports::transcoder::{
    TranscodeError, Transcoder, TrimScaleOptions, CONCAT_STEP, TRIM_STEP,
};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// ffmpeg prints its banner first and the actual error last.
const STDERR_TAIL_CHARS: usize = 2048;

pub struct FfmpegTranscoder<E = RealFfmpegExecutor> {
    executor: E,
}

impl FfmpegTranscoder {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self::with_executor(RealFfmpegExecutor::new(binary))
    }
}

impl<E: FfmpegExecutor> FfmpegTranscoder<E> {
    pub fn with_executor(executor: E) -> Self {
        Self { executor }
    }

    async fn run_step(
        &self,
        step: &'static str,
        args: Vec<String>,
        deadline: Option<Instant>,
    ) -> Result<(), TranscodeError> {
        debug!(step, ?args, "running ffmpeg");
        let run = self.executor.run_ffmpeg(args);
        let output = match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, run)
                .await
                .map_err(|_| TranscodeError::TimedOut { step })?,
            None => run.await,
        }
        .map_err(|source| TranscodeError::Spawn { step, source })?;

        if !output.status.success() {
            return Err(TranscodeError::Failed {
                step,
                status: output.status.to_string(),
                stderr: stderr_tail(&output.stderr),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl<E: FfmpegExecutor> Transcoder for FfmpegTranscoder<E> {
    async fn trim_and_scale(
        &self,
        input: &Path,
        output: &Path,
        options: &TrimScaleOptions,
        deadline: Option<Instant>,
    ) -> Result<(), TranscodeError> {
        self.run_step(TRIM_STEP, trim_scale_args(input, output, options), deadline)
            .await
    }

    async fn concat(
        &self,
        parts: &[PathBuf],
        output: &Path,
        deadline: Option<Instant>,
    ) -> Result<(), TranscodeError> {
        // the concat demuxer resolves relative entries against the list file
        let mut resolved = Vec::with_capacity(parts.len());
        for part in parts {
            resolved.push(tokio::fs::canonicalize(part).await?);
        }

        let list_path = output.with_extension("concat.txt");
        tokio::fs::write(&list_path, concat_list(&resolved)).await?;

        self.run_step(CONCAT_STEP, concat_args(&list_path, output), deadline)
            .await
    }
}

/// `ffmpeg -y -i <in> -t <secs> -vf scale=W:H,setdar=A -preset P <out>`
pub fn trim_scale_args(input: &Path, output: &Path, options: &TrimScaleOptions) -> Vec<String> {
    vec![
        "-y".to_string(),
        "-i".to_string(),
        path_arg(input),
        "-t".to_string(),
        seconds_arg(options.max_duration),
        "-vf".to_string(),
        format!(
            "scale={}:{},setdar={}",
            options.width, options.height, options.aspect
        ),
        "-preset".to_string(),
        options.preset.clone(),
        path_arg(output),
    ]
}

/// `ffmpeg -y -f concat -safe 0 -i <list> -c copy <out>`
pub fn concat_args(list: &Path, output: &Path) -> Vec<String> {
    vec![
        "-y".to_string(),
        "-f".to_string(),
        "concat".to_string(),
        "-safe".to_string(),
        "0".to_string(),
        "-i".to_string(),
        path_arg(list),
        "-c".to_string(),
        "copy".to_string(),
        path_arg(output),
    ]
}

/// Concat demuxer list, one `file '<path>'` line per part.
pub fn concat_list(parts: &[PathBuf]) -> String {
    parts
        .iter()
        .map(|part| format!("file '{}'\n", path_arg(part).replace('\'', r"'\''")))
        .collect()
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn seconds_arg(duration: Duration) -> String {
    if duration.subsec_nanos() == 0 {
        duration.as_secs().to_string()
    } else {
        format!("{:.3}", duration.as_secs_f64())
    }
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let text = text.trim();
    let start = text
        .char_indices()
        .rev()
        .nth(STDERR_TAIL_CHARS - 1)
        .map_or(0, |(i, _)| i);
    text[start..].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::ffmpeg::cmd::MockFfmpegExecutor;
    use std::io;
    use std::os::unix::process::ExitStatusExt;
    use std::process::{ExitStatus, Output};
    use tempfile::tempdir;

    fn create_mock_std_output(stderr_str: &str, success: bool) -> io::Result<Output> {
        Ok(Output {
            status: if success {
                ExitStatus::from_raw(0)
            } else {
                ExitStatus::from_raw(1 << 8)
            },
            stdout: Vec::new(),
            stderr: stderr_str.as_bytes().to_vec(),
        })
    }

    #[test]
    fn test_trim_scale_args() {
        let args = trim_scale_args(
            Path::new("/work/source.mov"),
            Path::new("/work/trimmed.mp4"),
            &TrimScaleOptions::default(),
        );
        assert_eq!(
            args,
            vec![
                "-y",
                "-i",
                "/work/source.mov",
                "-t",
                "30",
                "-vf",
                "scale=1280:720,setdar=16/9",
                "-preset",
                "fast",
                "/work/trimmed.mp4"
            ]
        );
    }

    #[test]
    fn test_fractional_duration_arg() {
        assert_eq!(seconds_arg(Duration::from_millis(12_500)), "12.500");
    }

    #[test]
    fn test_concat_list_escapes_quotes() {
        let list = concat_list(&[
            PathBuf::from("/media/intro.mp4"),
            PathBuf::from("/tmp/it's.mp4"),
        ]);
        assert_eq!(
            list,
            "file '/media/intro.mp4'\nfile '/tmp/it'\\''s.mp4'\n"
        );
    }

    #[tokio::test]
    async fn test_trim_and_scale_runs_ffmpeg_once() {
        let mut mock_runner = MockFfmpegExecutor::new();
        let expected = trim_scale_args(
            Path::new("in.mp4"),
            Path::new("out.mp4"),
            &TrimScaleOptions::default(),
        );
        mock_runner
            .expect_run_ffmpeg()
            .withf(move |args| args == &expected)
            .times(1)
            .returning(|_| create_mock_std_output("", true));

        let transcoder = FfmpegTranscoder::with_executor(mock_runner);
        let result = transcoder
            .trim_and_scale(
                Path::new("in.mp4"),
                Path::new("out.mp4"),
                &TrimScaleOptions::default(),
                None,
            )
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_nonzero_exit_surfaces_stderr() {
        let mut mock_runner = MockFfmpegExecutor::new();
        mock_runner.expect_run_ffmpeg().times(1).returning(|_| {
            create_mock_std_output(
                "ffmpeg version 6.1\n...\nin.mp4: Invalid data found when processing input\n",
                false,
            )
        });

        let transcoder = FfmpegTranscoder::with_executor(mock_runner);
        let err = transcoder
            .trim_and_scale(
                Path::new("in.mp4"),
                Path::new("out.mp4"),
                &TrimScaleOptions::default(),
                None,
            )
            .await
            .unwrap_err();

        match err {
            TranscodeError::Failed { step, stderr, .. } => {
                assert_eq!(step, TRIM_STEP);
                assert!(stderr.ends_with("Invalid data found when processing input"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_error() {
        let mut mock_runner = MockFfmpegExecutor::new();
        mock_runner
            .expect_run_ffmpeg()
            .returning(|_| Err(io::Error::new(io::ErrorKind::NotFound, "ffmpeg")));

        let transcoder = FfmpegTranscoder::with_executor(mock_runner);
        let err = transcoder
            .trim_and_scale(
                Path::new("in.mp4"),
                Path::new("out.mp4"),
                &TrimScaleOptions::default(),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TranscodeError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_concat_writes_list_of_absolute_parts() {
        let dir = tempdir().unwrap();
        let intro = dir.path().join("intro.mp4");
        let clip = dir.path().join("trimmed.mp4");
        std::fs::write(&intro, b"intro").unwrap();
        std::fs::write(&clip, b"clip").unwrap();
        let output = dir.path().join("final.mp4");
        let list_path = output.with_extension("concat.txt");

        let mut mock_runner = MockFfmpegExecutor::new();
        let expected = concat_args(&list_path, &output);
        mock_runner
            .expect_run_ffmpeg()
            .withf(move |args| args == &expected)
            .times(1)
            .returning(|_| create_mock_std_output("", true));

        let transcoder = FfmpegTranscoder::with_executor(mock_runner);
        transcoder
            .concat(&[intro.clone(), clip.clone(), intro.clone()], &output, None)
            .await
            .unwrap();

        let intro = std::fs::canonicalize(&intro).unwrap();
        let clip = std::fs::canonicalize(&clip).unwrap();
        let list = std::fs::read_to_string(&list_path).unwrap();
        assert_eq!(list, concat_list(&[intro.clone(), clip, intro]));
    }

    #[tokio::test]
    async fn test_concat_missing_part_fails_before_running() {
        let dir = tempdir().unwrap();
        let mut mock_runner = MockFfmpegExecutor::new();
        mock_runner.expect_run_ffmpeg().times(0);

        let transcoder = FfmpegTranscoder::with_executor(mock_runner);
        let err = transcoder
            .concat(
                &[dir.path().join("missing-intro.mp4")],
                &dir.path().join("final.mp4"),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TranscodeError::Io(_)));
    }

    struct SlowExecutor;

    #[async_trait]
    impl FfmpegExecutor for SlowExecutor {
        async fn run_ffmpeg(&self, _args: Vec<String>) -> io::Result<Output> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            create_mock_std_output("", true)
        }
    }

    #[tokio::test]
    async fn test_deadline_stops_slow_step() {
        let transcoder = FfmpegTranscoder::with_executor(SlowExecutor);
        let started = Instant::now();
        let err = transcoder
            .trim_and_scale(
                Path::new("in.mp4"),
                Path::new("out.mp4"),
                &TrimScaleOptions::default(),
                Some(Instant::now() + Duration::from_millis(50)),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, TranscodeError::TimedOut { step: TRIM_STEP }));
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
