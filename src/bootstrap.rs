//! Turns a [`PipelineConfig`] into connected adapters and services.
//!
//! Backends are chosen once here; everything downstream is generic over the
//! ports and receives trait objects.

use crate::adapters::ffmpeg::FfmpegTranscoder;
use crate::adapters::memory::{MemoryObjectStore, MemoryQueue, MemoryVideoStore};
use crate::application::intake::IntakeService;
use crate::application::pipeline::TranscodePipeline;
use crate::application::processor::{ProcessorSettings, TaskProcessor};
use crate::config::{PipelineConfig, QueueBackend, StorageBackend, VideoStoreBackend};
use crate::ports::queue::TaskQueue;
use crate::ports::repository::VideoRepository;
use crate::ports::storage::ObjectStore;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

pub type SharedQueue = Arc<dyn TaskQueue>;
pub type SharedVideos = Arc<dyn VideoRepository>;
pub type SharedStore = Arc<dyn ObjectStore>;

pub type Processor = TaskProcessor<SharedQueue, SharedVideos, SharedStore, FfmpegTranscoder>;
pub type Intake = IntakeService<SharedQueue, SharedVideos, SharedStore>;

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("{0} backend requires the '{1}' feature")]
    FeatureDisabled(&'static str, &'static str),

    #[cfg(feature = "local")]
    #[error(transparent)]
    Redis(#[from] crate::adapters::local::redis::RedisAdapterError),

    #[error("{path}: {source}")]
    Path {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Clone)]
pub struct Services {
    pub queue: SharedQueue,
    pub videos: SharedVideos,
    pub storage: SharedStore,
}

/// Connect every configured backend.
pub async fn connect(config: &PipelineConfig) -> Result<Services, BootstrapError> {
    #[cfg(feature = "aws")]
    let aws = AwsClients::default();

    let queue: SharedQueue = match &config.queue {
        QueueBackend::Memory => {
            warn!("memory queue: tasks do not survive a restart and are not shared between processes");
            Arc::new(MemoryQueue::new())
        }
        #[cfg(feature = "local")]
        QueueBackend::Redis { url, namespace } => {
            Arc::new(crate::adapters::local::RedisQueue::new(url, namespace)?)
        }
        #[cfg(feature = "aws")]
        QueueBackend::Sqs { queue_url } => Arc::new(crate::adapters::aws::SqsAdapter::new(
            aws_sdk_sqs::Client::new(aws.config().await),
            queue_url.clone(),
        )),
        #[allow(unreachable_patterns)]
        other => return Err(disabled(queue_backend_name(other))),
    };

    let videos: SharedVideos = match &config.videos {
        VideoStoreBackend::Memory => Arc::new(MemoryVideoStore::new()),
        #[cfg(feature = "local")]
        VideoStoreBackend::Redis { url, namespace } => {
            Arc::new(crate::adapters::local::RedisPool::new(url, namespace)?)
        }
        #[cfg(feature = "aws")]
        VideoStoreBackend::DynamoDb { table } => {
            Arc::new(crate::adapters::aws::DynamoAdapter::new(
                aws_sdk_dynamodb::Client::new(aws.config().await),
                table.clone(),
            ))
        }
        #[allow(unreachable_patterns)]
        other => return Err(disabled(video_store_name(other))),
    };

    let storage: SharedStore = match &config.storage {
        StorageBackend::Memory => Arc::new(MemoryObjectStore::new()),
        #[cfg(feature = "local")]
        StorageBackend::Fs { root } => Arc::new(crate::adapters::local::FsAdapter::new(
            absolute(root)?,
        )),
        #[cfg(feature = "aws")]
        StorageBackend::S3 { bucket } => Arc::new(crate::adapters::aws::S3Adapter::new(
            aws_sdk_s3::Client::new(aws.config().await),
            bucket.clone(),
        )),
        #[allow(unreachable_patterns)]
        other => return Err(disabled(storage_name(other))),
    };

    info!(
        queue = queue_backend_name(&config.queue),
        videos = video_store_name(&config.videos),
        storage = storage_name(&config.storage),
        "backends connected"
    );
    Ok(Services {
        queue,
        videos,
        storage,
    })
}

/// Build the task processor. The intro clip and the scratch parent are made
/// absolute and the scratch parent is created if needed.
pub async fn processor(
    config: &PipelineConfig,
    services: &Services,
) -> Result<Processor, BootstrapError> {
    let work_dir = absolute(&config.worker.work_dir)?;
    tokio::fs::create_dir_all(&work_dir)
        .await
        .map_err(|source| BootstrapError::Path {
            path: work_dir.clone(),
            source,
        })?;

    let intro = absolute(&config.transcode.intro_clip)?;
    if tokio::fs::metadata(&intro).await.is_err() {
        warn!(intro = %intro.display(), "intro clip not found; every transcode will fail");
    }

    let pipeline = TranscodePipeline::new(
        FfmpegTranscoder::new(config.transcode.ffmpeg_bin.clone()),
        intro,
        config.transcode.options.clone(),
    );
    let settings = ProcessorSettings {
        receive_wait: config.worker.receive_wait,
        infra_retry_delay: config.worker.infra_retry_delay,
        backoff: config.worker.backoff,
        work_dir,
    };
    Ok(TaskProcessor::new(
        services.queue.clone(),
        services.videos.clone(),
        services.storage.clone(),
        pipeline,
        settings,
    ))
}

pub fn intake(config: &PipelineConfig, services: &Services) -> Intake {
    IntakeService::new(
        services.queue.clone(),
        services.videos.clone(),
        services.storage.clone(),
        config.task_policy,
        config.http.link_ttl,
    )
}

fn absolute(path: &Path) -> Result<PathBuf, BootstrapError> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .map_err(|source| BootstrapError::Path {
            path: path.to_path_buf(),
            source,
        })
}

#[cfg_attr(all(feature = "local", feature = "aws"), allow(dead_code))]
fn disabled(backend: &'static str) -> BootstrapError {
    let feature = match backend {
        "sqs" | "s3" | "dynamodb" => "aws",
        _ => "local",
    };
    BootstrapError::FeatureDisabled(backend, feature)
}

fn queue_backend_name(backend: &QueueBackend) -> &'static str {
    match backend {
        QueueBackend::Sqs { .. } => "sqs",
        QueueBackend::Redis { .. } => "redis",
        QueueBackend::Memory => "memory",
    }
}

fn video_store_name(backend: &VideoStoreBackend) -> &'static str {
    match backend {
        VideoStoreBackend::DynamoDb { .. } => "dynamodb",
        VideoStoreBackend::Redis { .. } => "redis",
        VideoStoreBackend::Memory => "memory",
    }
}

fn storage_name(backend: &StorageBackend) -> &'static str {
    match backend {
        StorageBackend::S3 { .. } => "s3",
        StorageBackend::Fs { .. } => "fs",
        StorageBackend::Memory => "memory",
    }
}

/// Shared AWS configuration, loaded on first use.
#[cfg(feature = "aws")]
#[derive(Default)]
struct AwsClients {
    config: tokio::sync::OnceCell<aws_config::SdkConfig>,
}

#[cfg(feature = "aws")]
impl AwsClients {
    async fn config(&self) -> &aws_config::SdkConfig {
        self.config
            .get_or_init(|| aws_config::load_defaults(aws_config::BehaviorVersion::latest()))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::tasks::NewTask;
    use std::collections::HashMap;
    use std::time::Duration;

    fn memory_config(work_dir: &Path) -> PipelineConfig {
        let vars: HashMap<&str, String> = [
            ("QUEUE_BACKEND", "memory".to_string()),
            ("STORAGE_BACKEND", "memory".to_string()),
            ("VIDEO_STORE", "memory".to_string()),
            ("WORKER_WORK_DIR", work_dir.display().to_string()),
        ]
        .into_iter()
        .collect();
        PipelineConfig::from_lookup(|name| vars.get(name).cloned()).unwrap()
    }

    #[tokio::test]
    async fn test_connect_memory_backends() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = memory_config(&temp_dir.path().join("scratch"));
        let services = connect(&config).await.unwrap();

        let id = services
            .queue
            .enqueue(NewTask::process_video(1, config.task_policy))
            .await
            .unwrap();
        let task = services
            .queue
            .receive(Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(task.id, id);

        processor(&config, &services).await.unwrap();
        assert!(temp_dir.path().join("scratch").is_dir());
    }

    #[test]
    fn test_absolute_keeps_absolute_paths() {
        let path = Path::new("/var/lib/reelworks");
        assert_eq!(absolute(path).unwrap(), path);
        assert!(absolute(Path::new("scratch")).unwrap().is_absolute());
    }
}
