//! Consumer loop that turns queued tasks into processed videos.
//!
//! Every delivery runs resolving, staging, transcoding, publishing and
//! recording inside a scratch directory of its own. A failure is classified
//! into a [`Disposition`]: redeliver it, give up on the video, or discard a
//! task that can never succeed.

use crate::application::backoff::RetryBackoff;
use crate::application::pipeline::TranscodePipeline;
use crate::domain::tasks::{Task, VideoProcessPayload, VIDEO_PROCESS};
use crate::domain::videos::{derived_base_name, processed_key_for};
use crate::ports::queue::TaskQueue;
use crate::ports::repository::{RepositoryError, RepositoryResult, VideoRepository};
use crate::ports::storage::{ObjectStore, StorageError};
use crate::ports::transcoder::{TranscodeError, Transcoder};
use bytes::Bytes;
use chrono::Utc;
use std::fmt;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

#[derive(Debug, Clone)]
pub struct ProcessorSettings {
    /// Long-poll window of a single receive.
    pub receive_wait: Duration,
    /// Pause after a queue or video store outage.
    pub infra_retry_delay: Duration,
    pub backoff: RetryBackoff,
    /// Parent of the per-task scratch directories.
    pub work_dir: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Resolving,
    Staging,
    Transcoding,
    Publishing,
    Recording,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Resolving => "resolving",
            Stage::Staging => "staging",
            Stage::Transcoding => "transcoding",
            Stage::Publishing => "publishing",
            Stage::Recording => "recording",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("unsupported task type '{0}'")]
    UnsupportedTaskType(String),

    #[error("malformed payload: {0}")]
    MalformedPayload(#[source] serde_json::Error),

    #[error("video {0} not found")]
    VideoNotFound(u64),

    #[error("video {video_id} has an unusable original key '{key}'")]
    InvalidOriginalKey { video_id: u64, key: String },

    #[error("video store failed while {stage}: {source}")]
    Repository {
        stage: Stage,
        #[source]
        source: RepositoryError,
    },

    #[error("object store failed while {stage}: {source}")]
    Storage {
        stage: Stage,
        #[source]
        source: StorageError,
    },

    #[error("scratch space failed while {stage}: {source}")]
    Scratch {
        stage: Stage,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Transcode(#[from] TranscodeError),
}

/// What happens to a task whose processing failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Release the lease; the queue delivers the task again.
    Redeliver,
    /// Mark the video failed, then complete the task.
    GiveUp,
    /// Complete the task without touching any video.
    Discard,
}

impl ProcessError {
    pub fn stage(&self) -> Stage {
        match self {
            ProcessError::UnsupportedTaskType(_)
            | ProcessError::MalformedPayload(_)
            | ProcessError::VideoNotFound(_)
            | ProcessError::InvalidOriginalKey { .. } => Stage::Resolving,
            ProcessError::Repository { stage, .. }
            | ProcessError::Storage { stage, .. }
            | ProcessError::Scratch { stage, .. } => *stage,
            ProcessError::Transcode(_) => Stage::Transcoding,
        }
    }

    /// An unreachable video store. Retried in place while the lease lasts,
    /// then released after the fixed infrastructure delay.
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, ProcessError::Repository { source, .. } if source.is_unavailable())
    }

    pub fn disposition(&self, task: &Task) -> Disposition {
        match self {
            ProcessError::UnsupportedTaskType(_)
            | ProcessError::MalformedPayload(_)
            | ProcessError::VideoNotFound(_) => Disposition::Discard,
            ProcessError::InvalidOriginalKey { .. } => Disposition::GiveUp,
            ProcessError::Repository { source, .. } if source.is_unavailable() => {
                Disposition::Redeliver
            }
            // an unreadable record reads the same on every delivery
            ProcessError::Repository { .. } => Disposition::Discard,
            _ if task.retries_exhausted() => Disposition::GiveUp,
            _ => Disposition::Redeliver,
        }
    }
}

/// Result of handling one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Processed { video_id: u64, processed_key: String },
    Retrying { attempt: u32, delay: Duration },
    /// Released because of an infrastructure failure; the loop pauses.
    Deferred,
    GaveUp { video_id: u64 },
    Discarded,
}

pub struct TaskProcessor<Q, R, S, T> {
    queue: Q,
    videos: R,
    storage: S,
    pipeline: TranscodePipeline<T>,
    settings: ProcessorSettings,
}

impl<Q, R, S, T> TaskProcessor<Q, R, S, T>
where
    Q: TaskQueue,
    R: VideoRepository,
    S: ObjectStore,
    T: Transcoder,
{
    pub fn new(
        queue: Q,
        videos: R,
        storage: S,
        pipeline: TranscodePipeline<T>,
        settings: ProcessorSettings,
    ) -> Self {
        Self {
            queue,
            videos,
            storage,
            pipeline,
            settings,
        }
    }

    /// Receive and handle tasks until `shutdown` fires. A task already in
    /// hand is always finished before returning.
    pub async fn run(&self, worker_id: usize, shutdown: CancellationToken) {
        info!(worker_id, "worker started");
        loop {
            let received = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                received = self.queue.receive(self.settings.receive_wait) => received,
            };

            match received {
                Ok(Some(task)) => {
                    if self.handle(task).await == Outcome::Deferred {
                        self.pause(&shutdown).await;
                    }
                }
                Ok(None) => continue,
                Err(e) => {
                    error!(worker_id, error = %e, "queue receive failed");
                    self.pause(&shutdown).await;
                }
            }
        }
        info!(worker_id, "worker stopped");
    }

    async fn pause(&self, shutdown: &CancellationToken) {
        tokio::select! {
            _ = shutdown.cancelled() => {}
            _ = tokio::time::sleep(self.settings.infra_retry_delay) => {}
        }
    }

    /// Handle one delivery and settle it with the queue.
    pub async fn handle(&self, task: Task) -> Outcome {
        let span = info_span!(
            "task",
            task_id = %task.id,
            attempt = task.delivery_attempt,
            max_retry = task.max_retry
        );

        async {
            let started = Instant::now();
            info!(task_type = %task.task_type, "task received");

            let deadline = started.checked_add(task.timeout);
            let result = self.process(&task, deadline).await;

            let elapsed = started.elapsed();
            if elapsed > task.timeout {
                warn!(
                    elapsed_ms = elapsed.as_millis() as u64,
                    timeout_ms = task.timeout.as_millis() as u64,
                    "processing outlived the lease; another delivery may be running"
                );
            }

            match result {
                Ok((video_id, processed_key)) => {
                    info!(
                        video_id,
                        processed_key = %processed_key,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "video processed"
                    );
                    self.acknowledge(&task).await;
                    Outcome::Processed {
                        video_id,
                        processed_key,
                    }
                }
                Err(err) => self.resolve_failure(&task, err, deadline).await,
            }
        }
        .instrument(span)
        .await
    }

    async fn process(
        &self,
        task: &Task,
        deadline: Option<Instant>,
    ) -> Result<(u64, String), ProcessError> {
        if task.task_type != VIDEO_PROCESS {
            return Err(ProcessError::UnsupportedTaskType(task.task_type.clone()));
        }
        let payload: VideoProcessPayload = task
            .decode_payload()
            .map_err(ProcessError::MalformedPayload)?;
        let video_id = payload.video_id;

        // resolving
        let mut video = self
            .with_store(deadline, || self.videos.find_by_id(video_id))
            .await
            .map_err(|source| ProcessError::Repository {
                stage: Stage::Resolving,
                source,
            })?
            .ok_or(ProcessError::VideoNotFound(video_id))?;
        let invalid_key = || ProcessError::InvalidOriginalKey {
            video_id,
            key: video.original_key.clone(),
        };
        let base_name = derived_base_name(&video.original_key).ok_or_else(invalid_key)?;
        let processed_key = processed_key_for(&video.original_key).ok_or_else(invalid_key)?;

        // removed on drop, whichever way this function returns
        let scratch = self.scratch_dir(video_id).await?;

        // staging
        let original = self
            .storage
            .get(&video.original_key)
            .await
            .map_err(|source| ProcessError::Storage {
                stage: Stage::Staging,
                source,
            })?;
        let source_path = scratch.path().join(source_file_name(&video.original_key));
        tokio::fs::write(&source_path, &original)
            .await
            .map_err(|source| ProcessError::Scratch {
                stage: Stage::Staging,
                source,
            })?;
        drop(original);

        // transcoding
        let artifact = self
            .pipeline
            .run(&source_path, scratch.path(), &base_name, deadline)
            .await?;

        // publishing
        let body = tokio::fs::read(&artifact)
            .await
            .map_err(|source| ProcessError::Scratch {
                stage: Stage::Publishing,
                source,
            })?;
        self.storage
            .put(&processed_key, Bytes::from(body))
            .await
            .map_err(|source| ProcessError::Storage {
                stage: Stage::Publishing,
                source,
            })?;

        // recording
        video.mark_processed(processed_key.clone(), Utc::now());
        match self.with_store(deadline, || self.videos.update(&video)).await {
            Ok(()) => {}
            Err(RepositoryError::NotFound(_)) => {
                // withdrawn while transcoding; the published copy has no owner
                if let Err(e) = self.storage.delete(&processed_key).await {
                    warn!(key = %processed_key, error = %e, "failed to remove orphaned artifact");
                }
                return Err(ProcessError::VideoNotFound(video_id));
            }
            Err(source) => {
                return Err(ProcessError::Repository {
                    stage: Stage::Recording,
                    source,
                })
            }
        }

        if let Err(e) = scratch.close() {
            warn!(error = %e, "failed to remove scratch directory");
        }
        Ok((video_id, processed_key))
    }

    async fn scratch_dir(&self, video_id: u64) -> Result<TempDir, ProcessError> {
        let scratch_error = |source| ProcessError::Scratch {
            stage: Stage::Staging,
            source,
        };
        tokio::fs::create_dir_all(&self.settings.work_dir)
            .await
            .map_err(scratch_error)?;
        tempfile::Builder::new()
            .prefix(&format!("video-{}-", video_id))
            .tempdir_in(&self.settings.work_dir)
            .map_err(scratch_error)
    }

    async fn resolve_failure(
        &self,
        task: &Task,
        err: ProcessError,
        deadline: Option<Instant>,
    ) -> Outcome {
        let stage = err.stage();
        match err.disposition(task) {
            Disposition::Discard => {
                warn!(%stage, error = %err, "discarding task that can never succeed");
                self.acknowledge(task).await;
                Outcome::Discarded
            }
            Disposition::Redeliver if err.is_infrastructure() => {
                error!(%stage, error = %err, "video store unavailable; releasing task");
                self.release(task, self.settings.infra_retry_delay).await;
                Outcome::Deferred
            }
            Disposition::Redeliver => {
                let delay = self.settings.backoff.delay_for(task.delivery_attempt);
                warn!(
                    %stage,
                    error = %err,
                    retry_in_ms = delay.as_millis() as u64,
                    "processing failed; task will be redelivered"
                );
                self.release(task, delay).await;
                Outcome::Retrying {
                    attempt: task.delivery_attempt,
                    delay,
                }
            }
            Disposition::GiveUp => {
                error!(
                    %stage,
                    error = %err,
                    deliveries = task.delivery_attempt,
                    "giving up on task"
                );
                self.give_up(task, deadline).await
            }
        }
    }

    async fn give_up(&self, task: &Task, deadline: Option<Instant>) -> Outcome {
        // only reachable once the payload decoded
        let Ok(VideoProcessPayload { video_id }) = task.decode_payload::<VideoProcessPayload>()
        else {
            self.acknowledge(task).await;
            return Outcome::Discarded;
        };

        match self.record_failure(video_id, deadline).await {
            Ok(()) => {
                self.acknowledge(task).await;
                Outcome::GaveUp { video_id }
            }
            Err(e) if e.is_unavailable() => {
                error!(video_id, error = %e, "could not record failure; releasing task");
                self.release(task, self.settings.infra_retry_delay).await;
                Outcome::Deferred
            }
            Err(e) => {
                error!(video_id, error = %e, "video record unusable; dropping task");
                self.acknowledge(task).await;
                Outcome::Discarded
            }
        }
    }

    async fn record_failure(
        &self,
        video_id: u64,
        deadline: Option<Instant>,
    ) -> Result<(), RepositoryError> {
        let found = self
            .with_store(deadline, || self.videos.find_by_id(video_id))
            .await?;
        let Some(mut video) = found else {
            warn!(video_id, "video vanished before its failure could be recorded");
            return Ok(());
        };
        if let Err(e) = video.mark_failed() {
            warn!(error = %e, "keeping the result of an earlier successful delivery");
            return Ok(());
        }
        match self.with_store(deadline, || self.videos.update(&video)).await {
            Err(RepositoryError::NotFound(_)) => {
                warn!(video_id, "video vanished before its failure could be recorded");
                Ok(())
            }
            other => other,
        }
    }

    /// Run a video store call, waiting out an outage in place while the
    /// lease still has room for another try. Redelivering instead would
    /// cost the task a delivery attempt.
    async fn with_store<O, F, Fut>(
        &self,
        deadline: Option<Instant>,
        mut call: F,
    ) -> RepositoryResult<O>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = RepositoryResult<O>>,
    {
        let pause = self.settings.infra_retry_delay;
        let mut tries = 1u32;
        loop {
            match call().await {
                Err(e) if e.is_unavailable() => {
                    let retry_at = Instant::now().checked_add(pause);
                    let fits = matches!((retry_at, deadline), (Some(at), Some(d)) if at < d);
                    if !fits {
                        return Err(e);
                    }
                    warn!(tries, error = %e, "video store unavailable; retrying in place");
                    tokio::time::sleep(pause).await;
                    tries += 1;
                }
                result => return result,
            }
        }
    }

    async fn acknowledge(&self, task: &Task) {
        match self.queue.complete(task).await {
            Ok(()) => {}
            Err(e) if e.is_lease_not_found() => {
                warn!(error = %e, "lease already gone; task was redelivered elsewhere")
            }
            Err(e) => error!(error = %e, "failed to complete task; it will be redelivered"),
        }
    }

    async fn release(&self, task: &Task, delay: Duration) {
        match self.queue.fail(task, delay).await {
            Ok(()) => {}
            Err(e) if e.is_lease_not_found() => {
                warn!(error = %e, "lease already gone; the queue redelivers on its own")
            }
            Err(e) => error!(error = %e, "failed to release task; lease expiry will redeliver it"),
        }
    }
}

fn source_file_name(original_key: &str) -> String {
    match Path::new(original_key).extension().and_then(|e| e.to_str()) {
        Some(ext) if !ext.is_empty() => format!("source.{}", ext),
        _ => "source.mp4".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::{MemoryObjectStore, MemoryQueue, MemoryVideoStore};
    use crate::domain::tasks::{
        LeaseToken, NewTask, TaskEnvelope, TaskId, TaskPolicy,
    };
    use crate::domain::videos::{NewVideo, Video, VideoStatus};
    use crate::ports::transcoder::{TrimScaleOptions, CONCAT_STEP, TRIM_STEP};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tempfile::{tempdir, TempDir};

    /// Writes placeholder artifacts instead of running ffmpeg.
    #[derive(Default)]
    struct FakeTranscoder {
        failures_left: AtomicU32,
        trims: AtomicU32,
        delay: Duration,
    }

    impl FakeTranscoder {
        fn failing(times: u32) -> Self {
            Self {
                failures_left: AtomicU32::new(times),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl Transcoder for FakeTranscoder {
        async fn trim_and_scale(
            &self,
            input: &Path,
            output: &Path,
            _options: &TrimScaleOptions,
            _deadline: Option<Instant>,
        ) -> Result<(), TranscodeError> {
            self.trims.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            // the staged original must be there
            tokio::fs::read(input).await?;
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err(TranscodeError::Failed {
                    step: TRIM_STEP,
                    status: "exit status: 1".to_string(),
                    stderr: "moov atom not found".to_string(),
                });
            }
            tokio::fs::write(output, b"trimmed").await?;
            Ok(())
        }

        async fn concat(
            &self,
            _parts: &[PathBuf],
            output: &Path,
            _deadline: Option<Instant>,
        ) -> Result<(), TranscodeError> {
            tokio::fs::write(output, b"intro|clip|intro").await?;
            Ok(())
        }
    }

    type TestProcessor =
        TaskProcessor<MemoryQueue, MemoryVideoStore, MemoryObjectStore, Arc<FakeTranscoder>>;

    struct Harness {
        queue: MemoryQueue,
        videos: MemoryVideoStore,
        storage: MemoryObjectStore,
        transcoder: Arc<FakeTranscoder>,
        work_dir: TempDir,
        processor: Arc<TestProcessor>,
    }

    fn settings(work_dir: &Path) -> ProcessorSettings {
        ProcessorSettings {
            receive_wait: Duration::from_millis(50),
            infra_retry_delay: Duration::from_millis(10),
            backoff: RetryBackoff::immediate(),
            work_dir: work_dir.join("scratch"),
        }
    }

    fn harness(transcoder: FakeTranscoder) -> Harness {
        let queue = MemoryQueue::new();
        let videos = MemoryVideoStore::new();
        let storage = MemoryObjectStore::new();
        let transcoder = Arc::new(transcoder);
        let work_dir = tempdir().unwrap();
        let processor = TaskProcessor::new(
            queue.clone(),
            videos.clone(),
            storage.clone(),
            TranscodePipeline::new(
                transcoder.clone(),
                PathBuf::from("intro.mp4"),
                TrimScaleOptions::default(),
            ),
            settings(work_dir.path()),
        );
        Harness {
            queue,
            videos,
            storage,
            transcoder,
            work_dir,
            processor: Arc::new(processor),
        }
    }

    impl Harness {
        async fn seed_video(&self, id: u64) -> Video {
            let video = self.seed_record(id).await;
            self.storage
                .put(&video.original_key, Bytes::from_static(b"raw video"))
                .await
                .unwrap();
            video
        }

        async fn seed_record(&self, id: u64) -> Video {
            let video = Video::from_new(
                id,
                NewVideo {
                    owner_id: 7,
                    title: "Dunk".to_string(),
                    original_key: format!("originals/1700-{}.mov", id),
                },
                Utc::now(),
            );
            self.videos.insert(video.clone()).await;
            video
        }

        async fn enqueue(&self, video_id: u64, max_retry: u32) -> TaskId {
            self.enqueue_with_timeout(video_id, max_retry, Duration::from_secs(60))
                .await
        }

        async fn enqueue_with_timeout(
            &self,
            video_id: u64,
            max_retry: u32,
            timeout: Duration,
        ) -> TaskId {
            self.queue
                .enqueue(NewTask::process_video(
                    video_id,
                    TaskPolicy { max_retry, timeout },
                ))
                .await
                .unwrap()
        }

        async fn next_task(&self) -> Task {
            self.queue
                .receive(Duration::from_millis(200))
                .await
                .unwrap()
                .expect("a task should be delivered")
        }

        async fn video(&self, id: u64) -> Video {
            self.videos.find_by_id(id).await.unwrap().unwrap()
        }

        fn scratch_entries(&self) -> usize {
            std::fs::read_dir(self.work_dir.path().join("scratch"))
                .map(|dir| dir.count())
                .unwrap_or(0)
        }
    }

    #[tokio::test]
    async fn test_fails_twice_then_processes_on_third_delivery() {
        let h = harness(FakeTranscoder::failing(2));
        h.seed_video(42).await;
        h.enqueue(42, 3).await;

        for attempt in 1..=2 {
            let task = h.next_task().await;
            assert_eq!(task.delivery_attempt, attempt);
            assert_eq!(
                h.processor.handle(task).await,
                Outcome::Retrying {
                    attempt,
                    delay: Duration::ZERO
                }
            );
            assert_eq!(h.video(42).await.status, VideoStatus::Uploaded);
        }

        let task = h.next_task().await;
        assert_eq!(task.delivery_attempt, 3);
        assert_eq!(
            h.processor.handle(task).await,
            Outcome::Processed {
                video_id: 42,
                processed_key: "processed/1700-42.mp4".to_string()
            }
        );

        let video = h.video(42).await;
        assert_eq!(video.status, VideoStatus::Processed);
        assert_eq!(video.processed_key.as_deref(), Some("processed/1700-42.mp4"));
        assert!(video.processed_at.is_some());
        assert_eq!(
            h.storage.get("processed/1700-42.mp4").await.unwrap(),
            Bytes::from_static(b"intro|clip|intro")
        );
        assert!(h.queue.is_empty().await);
        assert_eq!(h.scratch_entries(), 0);
    }

    #[tokio::test]
    async fn test_retry_ceiling_marks_video_failed_and_completes_task() {
        let h = harness(FakeTranscoder::failing(u32::MAX));
        h.seed_video(42).await;
        h.enqueue(42, 3).await;

        for attempt in 1..=2 {
            let task = h.next_task().await;
            assert!(matches!(
                h.processor.handle(task).await,
                Outcome::Retrying { attempt: a, .. } if a == attempt
            ));
        }
        let task = h.next_task().await;
        assert_eq!(h.processor.handle(task).await, Outcome::GaveUp { video_id: 42 });

        let video = h.video(42).await;
        assert_eq!(video.status, VideoStatus::Failed);
        assert!(video.processed_key.is_none());
        assert!(h.queue.is_empty().await);
        assert!(h
            .queue
            .receive(Duration::from_millis(20))
            .await
            .unwrap()
            .is_none());
        assert_eq!(h.transcoder.trims.load(Ordering::SeqCst), 3);
        assert_eq!(h.scratch_entries(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_delivery_overwrites_same_artifact() {
        let h = harness(FakeTranscoder::default());
        h.seed_video(5).await;
        h.enqueue(5, 3).await;
        h.enqueue(5, 3).await;

        for _ in 0..2 {
            let task = h.next_task().await;
            assert!(matches!(
                h.processor.handle(task).await,
                Outcome::Processed { video_id: 5, .. }
            ));
        }

        assert_eq!(
            h.storage.keys().await,
            vec![
                "originals/1700-5.mov".to_string(),
                "processed/1700-5.mp4".to_string()
            ]
        );
        assert_eq!(h.video(5).await.status, VideoStatus::Processed);
        assert_eq!(h.scratch_entries(), 0);
    }

    #[tokio::test]
    async fn test_missing_video_is_discarded() {
        let h = harness(FakeTranscoder::default());
        h.enqueue(999, 3).await;

        let task = h.next_task().await;
        assert_eq!(h.processor.handle(task).await, Outcome::Discarded);
        assert!(h.queue.is_empty().await);
        assert_eq!(h.transcoder.trims.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_malformed_payload_is_discarded() {
        let h = harness(FakeTranscoder::default());
        h.queue
            .enqueue(NewTask {
                task_type: VIDEO_PROCESS.to_string(),
                payload: serde_json::json!({ "video": "abc" }),
                max_retry: 3,
                timeout: Duration::from_secs(60),
            })
            .await
            .unwrap();

        let task = h.next_task().await;
        assert_eq!(h.processor.handle(task).await, Outcome::Discarded);
        assert!(h.queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_unknown_task_type_is_discarded() {
        let h = harness(FakeTranscoder::default());
        h.queue
            .enqueue(NewTask {
                task_type: "email:send".to_string(),
                payload: serde_json::json!({ "video_id": 1 }),
                max_retry: 3,
                timeout: Duration::from_secs(60),
            })
            .await
            .unwrap();

        let task = h.next_task().await;
        assert_eq!(h.processor.handle(task).await, Outcome::Discarded);
    }

    #[tokio::test]
    async fn test_missing_original_is_retried_then_failed() {
        let h = harness(FakeTranscoder::default());
        h.seed_record(8).await;
        h.enqueue(8, 2).await;

        let task = h.next_task().await;
        assert!(matches!(
            h.processor.handle(task).await,
            Outcome::Retrying { attempt: 1, .. }
        ));
        let task = h.next_task().await;
        assert_eq!(h.processor.handle(task).await, Outcome::GaveUp { video_id: 8 });
        assert_eq!(h.video(8).await.status, VideoStatus::Failed);
    }

    #[tokio::test]
    async fn test_processed_video_survives_exhausted_duplicate() {
        let h = harness(FakeTranscoder::failing(u32::MAX));
        let mut video = h.seed_video(3).await;
        video.mark_processed("processed/1700-3.mp4".to_string(), Utc::now());
        h.videos.update(&video).await.unwrap();
        h.enqueue(3, 1).await;

        let task = h.next_task().await;
        assert_eq!(h.processor.handle(task).await, Outcome::GaveUp { video_id: 3 });

        let video = h.video(3).await;
        assert_eq!(video.status, VideoStatus::Processed);
        assert_eq!(video.processed_key.as_deref(), Some("processed/1700-3.mp4"));
        assert!(h.queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_lost_lease_on_release_is_tolerated() {
        let h = harness(FakeTranscoder {
            failures_left: AtomicU32::new(1),
            delay: Duration::from_millis(60),
            ..Default::default()
        });
        h.seed_video(11).await;
        h.enqueue_with_timeout(11, 3, Duration::from_millis(20)).await;

        // the lease runs out while the first attempt is still transcoding
        let task = h.next_task().await;
        assert!(matches!(
            h.processor.handle(task).await,
            Outcome::Retrying { attempt: 1, .. }
        ));

        let task = h.next_task().await;
        assert_eq!(task.delivery_attempt, 2);
        assert!(matches!(
            h.processor.handle(task).await,
            Outcome::Processed { video_id: 11, .. }
        ));
    }

    struct UnavailableVideos;

    #[async_trait]
    impl VideoRepository for UnavailableVideos {
        async fn create(&self, _video: NewVideo) -> RepositoryResult<Video> {
            Err(RepositoryError::Unavailable("connection refused".to_string()))
        }

        async fn find_by_id(&self, _id: u64) -> RepositoryResult<Option<Video>> {
            Err(RepositoryError::Unavailable("connection refused".to_string()))
        }

        async fn update(&self, _video: &Video) -> RepositoryResult<()> {
            Err(RepositoryError::Unavailable("connection refused".to_string()))
        }

        async fn delete(&self, _id: u64) -> RepositoryResult<()> {
            Err(RepositoryError::Unavailable("connection refused".to_string()))
        }
    }

    #[tokio::test]
    async fn test_video_store_outage_defers_without_giving_up() {
        let queue = MemoryQueue::new();
        let work_dir = tempdir().unwrap();
        let processor = TaskProcessor::new(
            queue.clone(),
            UnavailableVideos,
            MemoryObjectStore::new(),
            TranscodePipeline::new(
                FakeTranscoder::default(),
                PathBuf::from("intro.mp4"),
                TrimScaleOptions::default(),
            ),
            settings(work_dir.path()),
        );
        // already at the ceiling: an ordinary failure would give up here
        queue
            .enqueue(NewTask::process_video(
                1,
                TaskPolicy {
                    max_retry: 1,
                    timeout: Duration::from_millis(100),
                },
            ))
            .await
            .unwrap();

        let task = queue.receive(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(processor.handle(task).await, Outcome::Deferred);
        assert_eq!(queue.len().await, 1);
    }

    fn processor_with<R: VideoRepository>(
        queue: &MemoryQueue,
        videos: R,
        storage: &MemoryObjectStore,
        transcoder: Arc<FakeTranscoder>,
        work_dir: &Path,
    ) -> TaskProcessor<MemoryQueue, R, MemoryObjectStore, Arc<FakeTranscoder>> {
        TaskProcessor::new(
            queue.clone(),
            videos,
            storage.clone(),
            TranscodePipeline::new(
                transcoder,
                PathBuf::from("intro.mp4"),
                TrimScaleOptions::default(),
            ),
            settings(work_dir),
        )
    }

    /// Unreachable for the first `outages` lookups, then a plain memory store.
    struct FlakyVideos {
        inner: MemoryVideoStore,
        outages: AtomicU32,
    }

    #[async_trait]
    impl VideoRepository for FlakyVideos {
        async fn create(&self, video: NewVideo) -> RepositoryResult<Video> {
            self.inner.create(video).await
        }

        async fn find_by_id(&self, id: u64) -> RepositoryResult<Option<Video>> {
            if self.outages.load(Ordering::SeqCst) > 0 {
                self.outages.fetch_sub(1, Ordering::SeqCst);
                return Err(RepositoryError::Unavailable("connection reset".to_string()));
            }
            self.inner.find_by_id(id).await
        }

        async fn update(&self, video: &Video) -> RepositoryResult<()> {
            self.inner.update(video).await
        }

        async fn delete(&self, id: u64) -> RepositoryResult<()> {
            self.inner.delete(id).await
        }
    }

    #[tokio::test]
    async fn test_short_outage_does_not_cost_a_delivery() {
        let queue = MemoryQueue::new();
        let storage = MemoryObjectStore::new();
        let records = MemoryVideoStore::new();
        let transcoder = Arc::new(FakeTranscoder::failing(u32::MAX));
        let work_dir = tempdir().unwrap();

        let video = Video::from_new(
            1,
            NewVideo {
                owner_id: 7,
                title: "Dunk".to_string(),
                original_key: "originals/1700-1.mov".to_string(),
            },
            Utc::now(),
        );
        records.insert(video.clone()).await;
        storage
            .put(&video.original_key, Bytes::from_static(b"raw video"))
            .await
            .unwrap();

        let processor = processor_with(
            &queue,
            FlakyVideos {
                inner: records.clone(),
                outages: AtomicU32::new(3),
            },
            &storage,
            transcoder.clone(),
            work_dir.path(),
        );
        queue
            .enqueue(NewTask::process_video(
                1,
                TaskPolicy {
                    max_retry: 3,
                    timeout: Duration::from_secs(60),
                },
            ))
            .await
            .unwrap();

        for attempt in 1..=2 {
            let task = queue.receive(Duration::ZERO).await.unwrap().unwrap();
            assert_eq!(task.delivery_attempt, attempt);
            assert!(matches!(
                processor.handle(task).await,
                Outcome::Retrying { attempt: a, .. } if a == attempt
            ));
        }
        let task = queue.receive(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(processor.handle(task).await, Outcome::GaveUp { video_id: 1 });

        // every delivery reached the transcoder
        assert_eq!(transcoder.trims.load(Ordering::SeqCst), 3);
        assert_eq!(
            records.find_by_id(1).await.unwrap().unwrap().status,
            VideoStatus::Failed
        );
    }

    struct CorruptVideos;

    #[async_trait]
    impl VideoRepository for CorruptVideos {
        async fn create(&self, _video: NewVideo) -> RepositoryResult<Video> {
            Err(RepositoryError::Corrupt(
                "video 1 attribute status: missing string".to_string(),
            ))
        }

        async fn find_by_id(&self, _id: u64) -> RepositoryResult<Option<Video>> {
            Err(RepositoryError::Corrupt(
                "video 1 attribute status: missing string".to_string(),
            ))
        }

        async fn update(&self, _video: &Video) -> RepositoryResult<()> {
            Ok(())
        }

        async fn delete(&self, _id: u64) -> RepositoryResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_unreadable_record_is_discarded_not_redelivered() {
        let queue = MemoryQueue::new();
        let work_dir = tempdir().unwrap();
        let transcoder = Arc::new(FakeTranscoder::default());
        let processor = processor_with(
            &queue,
            CorruptVideos,
            &MemoryObjectStore::new(),
            transcoder.clone(),
            work_dir.path(),
        );
        queue
            .enqueue(NewTask::process_video(
                1,
                TaskPolicy {
                    max_retry: 3,
                    timeout: Duration::from_secs(60),
                },
            ))
            .await
            .unwrap();

        let task = queue.receive(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(processor.handle(task).await, Outcome::Discarded);
        assert!(queue.is_empty().await);
        assert_eq!(transcoder.trims.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_video_withdrawn_mid_transcode_is_not_recreated() {
        let h = harness(FakeTranscoder {
            delay: Duration::from_millis(80),
            ..Default::default()
        });
        h.seed_video(9).await;
        h.enqueue(9, 3).await;

        let task = h.next_task().await;
        let handling = {
            let processor = h.processor.clone();
            tokio::spawn(async move { processor.handle(task).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        h.videos.delete(9).await.unwrap();

        assert_eq!(handling.await.unwrap(), Outcome::Discarded);
        assert!(h.videos.find_by_id(9).await.unwrap().is_none());
        assert!(!h.storage.contains("processed/1700-9.mp4").await);
        assert!(h.queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_run_loop_drains_queue_until_shutdown() {
        let h = harness(FakeTranscoder::default());
        h.seed_video(21).await;
        h.enqueue(21, 3).await;

        let shutdown = CancellationToken::new();
        let worker = {
            let processor = h.processor.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { processor.run(0, shutdown).await })
        };

        let started = Instant::now();
        while h.video(21).await.status != VideoStatus::Processed {
            assert!(started.elapsed() < Duration::from_secs(5), "task was never processed");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(2), worker)
            .await
            .expect("worker should stop after shutdown")
            .unwrap();
        assert!(h.queue.is_empty().await);
    }

    fn task_at(attempt: u32, max_retry: u32) -> Task {
        TaskEnvelope::from_new(&NewTask::process_video(
            1,
            TaskPolicy {
                max_retry,
                timeout: Duration::from_secs(1),
            },
        ))
        .into_task(TaskId::new("t"), attempt, LeaseToken::new("l"))
    }

    #[test]
    fn test_disposition_table() {
        let transcode = || {
            ProcessError::Transcode(TranscodeError::TimedOut { step: CONCAT_STEP })
        };
        assert_eq!(transcode().disposition(&task_at(1, 3)), Disposition::Redeliver);
        assert_eq!(transcode().disposition(&task_at(3, 3)), Disposition::GiveUp);
        assert_eq!(
            ProcessError::VideoNotFound(1).disposition(&task_at(1, 3)),
            Disposition::Discard
        );
        assert_eq!(
            ProcessError::Repository {
                stage: Stage::Recording,
                source: RepositoryError::Unavailable("down".to_string()),
            }
            .disposition(&task_at(3, 3)),
            Disposition::Redeliver
        );
        assert_eq!(
            ProcessError::Repository {
                stage: Stage::Resolving,
                source: RepositoryError::Corrupt("bad status".to_string()),
            }
            .disposition(&task_at(1, 3)),
            Disposition::Discard
        );
        assert_eq!(
            ProcessError::InvalidOriginalKey {
                video_id: 1,
                key: String::new()
            }
            .disposition(&task_at(1, 3)),
            Disposition::GiveUp
        );
    }

    #[test]
    fn test_source_file_keeps_original_extension() {
        assert_eq!(source_file_name("originals/1-2.mov"), "source.mov");
        assert_eq!(source_file_name("originals/1-2"), "source.mp4");
    }
}
