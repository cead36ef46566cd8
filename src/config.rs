//! Configuration loaded from the environment (and an optional `.env` file).

use crate::application::backoff::RetryBackoff;
use crate::domain::tasks::TaskPolicy;
use crate::ports::transcoder::TrimScaleOptions;
use std::env;
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} env var required")]
    Missing(&'static str),

    #[error("invalid value '{value}' for {var}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum QueueBackend {
    Sqs { queue_url: String },
    Redis { url: String, namespace: String },
    /// Process-local; tasks are lost on exit.
    Memory,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StorageBackend {
    S3 { bucket: String },
    Fs { root: PathBuf },
    Memory,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VideoStoreBackend {
    DynamoDb { table: String },
    Redis { url: String, namespace: String },
    Memory,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerConfig {
    pub count: usize,
    pub work_dir: PathBuf,
    pub receive_wait: Duration,
    pub backoff: RetryBackoff,
    pub infra_retry_delay: Duration,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TranscodeConfig {
    pub ffmpeg_bin: PathBuf,
    /// Clip placed before and after every processed video.
    pub intro_clip: PathBuf,
    pub options: TrimScaleOptions,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HttpConfig {
    pub addr: String,
    pub port: u16,
    pub max_upload_bytes: usize,
    /// Lifetime of the presigned links handed out by the view endpoint.
    pub link_ttl: Duration,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PipelineConfig {
    pub queue: QueueBackend,
    pub storage: StorageBackend,
    pub videos: VideoStoreBackend,
    pub task_policy: TaskPolicy,
    pub worker: WorkerConfig,
    pub transcode: TranscodeConfig,
    pub http: HttpConfig,
}

impl PipelineConfig {
    /// Load configuration from `.env` and the process environment.
    pub fn from_env() -> ConfigResult<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build the configuration from any variable source.
    pub fn from_lookup<F>(lookup: F) -> ConfigResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars(lookup);

        let redis_url = || vars.or("REDIS_URL", "redis://127.0.0.1/");
        let redis_namespace = || vars.or("REDIS_NAMESPACE", "reelworks");

        let queue = match vars.or("QUEUE_BACKEND", "redis").as_str() {
            "sqs" => QueueBackend::Sqs {
                queue_url: vars.required("SQS_QUEUE_URL")?,
            },
            "redis" => QueueBackend::Redis {
                url: redis_url(),
                namespace: redis_namespace(),
            },
            "memory" => QueueBackend::Memory,
            other => return Err(unknown_backend("QUEUE_BACKEND", other)),
        };

        let storage = match vars.or("STORAGE_BACKEND", "fs").as_str() {
            "s3" => StorageBackend::S3 {
                bucket: vars.required("S3_BUCKET")?,
            },
            "fs" => StorageBackend::Fs {
                root: PathBuf::from(vars.or("STORAGE_DIR", "./storage")),
            },
            "memory" => StorageBackend::Memory,
            other => return Err(unknown_backend("STORAGE_BACKEND", other)),
        };

        let videos = match vars.or("VIDEO_STORE", "redis").as_str() {
            "dynamodb" => VideoStoreBackend::DynamoDb {
                table: vars.required("DYNAMODB_TABLE")?,
            },
            "redis" => VideoStoreBackend::Redis {
                url: redis_url(),
                namespace: redis_namespace(),
            },
            "memory" => VideoStoreBackend::Memory,
            other => return Err(unknown_backend("VIDEO_STORE", other)),
        };

        let defaults = TaskPolicy::default();
        let task_policy = TaskPolicy {
            max_retry: vars.parse("TASK_MAX_RETRY", defaults.max_retry)?,
            timeout: vars.secs("TASK_TIMEOUT_SECS", defaults.timeout)?,
        };
        if task_policy.max_retry == 0 {
            return Err(invalid("TASK_MAX_RETRY", "0", "must be at least 1"));
        }
        if task_policy.timeout.is_zero() {
            return Err(invalid("TASK_TIMEOUT_SECS", "0", "must be positive"));
        }

        let default_backoff = RetryBackoff::default();
        let backoff = RetryBackoff {
            base: vars.secs("RETRY_BACKOFF_BASE_SECS", default_backoff.base)?,
            max: vars.secs("RETRY_BACKOFF_MAX_SECS", default_backoff.max)?,
        };
        let worker = WorkerConfig {
            count: vars.parse("WORKER_COUNT", default_worker_count())?,
            work_dir: vars
                .get("WORKER_WORK_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(env::temp_dir),
            receive_wait: vars.secs("RECEIVE_WAIT_SECS", Duration::from_secs(20))?,
            backoff,
            infra_retry_delay: Duration::from_millis(vars.parse("INFRA_RETRY_DELAY_MS", 1000)?),
        };
        if worker.count == 0 {
            return Err(invalid("WORKER_COUNT", "0", "must be at least 1"));
        }

        let default_options = TrimScaleOptions::default();
        let transcode = TranscodeConfig {
            ffmpeg_bin: PathBuf::from(vars.or("FFMPEG_BIN", "ffmpeg")),
            intro_clip: PathBuf::from(vars.or("INTRO_CLIP", "assets/intro.mp4")),
            options: TrimScaleOptions {
                max_duration: vars.secs("CLIP_MAX_SECONDS", default_options.max_duration)?,
                width: vars.parse("CLIP_WIDTH", default_options.width)?,
                height: vars.parse("CLIP_HEIGHT", default_options.height)?,
                aspect: vars.or("CLIP_ASPECT", &default_options.aspect),
                preset: vars.or("CLIP_PRESET", &default_options.preset),
            },
        };

        let http = HttpConfig {
            addr: vars.or("ADDR", "127.0.0.1"),
            port: vars.parse("PORT", 3000)?,
            max_upload_bytes: vars.parse("MAX_UPLOAD_BYTES", 512 * 1024 * 1024)?,
            link_ttl: vars.secs("LINK_TTL_SECS", Duration::from_secs(3600))?,
        };

        Ok(Self {
            queue,
            storage,
            videos,
            task_policy,
            worker,
            transcode,
            http,
        })
    }
}

fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn invalid(var: &'static str, value: &str, reason: impl Display) -> ConfigError {
    ConfigError::Invalid {
        var,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn unknown_backend(var: &'static str, value: &str) -> ConfigError {
    invalid(var, value, "unknown backend")
}

struct Vars<F>(F);

impl<F> Vars<F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Unset and blank variables are treated alike.
    fn get(&self, name: &str) -> Option<String> {
        (self.0)(name)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn or(&self, name: &str, default: &str) -> String {
        self.get(name).unwrap_or_else(|| default.to_string())
    }

    fn required(&self, name: &'static str) -> ConfigResult<String> {
        self.get(name).ok_or(ConfigError::Missing(name))
    }

    fn parse<T>(&self, name: &'static str, default: T) -> ConfigResult<T>
    where
        T: FromStr,
        T::Err: Display,
    {
        match self.get(name) {
            Some(value) => value.parse().map_err(|e| invalid(name, &value, e)),
            None => Ok(default),
        }
    }

    fn secs(&self, name: &'static str, default: Duration) -> ConfigResult<Duration> {
        match self.get(name) {
            Some(value) => value
                .parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|e| invalid(name, &value, e)),
            None => Ok(default),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(pairs: &[(&str, &str)]) -> ConfigResult<PipelineConfig> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        PipelineConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(
            config.queue,
            QueueBackend::Redis {
                url: "redis://127.0.0.1/".to_string(),
                namespace: "reelworks".to_string()
            }
        );
        assert_eq!(
            config.storage,
            StorageBackend::Fs {
                root: PathBuf::from("./storage")
            }
        );
        assert_eq!(config.task_policy, TaskPolicy::default());
        assert_eq!(config.worker.receive_wait, Duration::from_secs(20));
        assert_eq!(config.worker.infra_retry_delay, Duration::from_millis(1000));
        assert_eq!(config.transcode.options, TrimScaleOptions::default());
        assert_eq!(config.http.port, 3000);
    }

    #[test]
    fn test_aws_backends() {
        let config = load(&[
            ("QUEUE_BACKEND", "sqs"),
            ("SQS_QUEUE_URL", "https://sqs.eu-west-1.amazonaws.com/1/videos"),
            ("STORAGE_BACKEND", "s3"),
            ("S3_BUCKET", "videos"),
            ("VIDEO_STORE", "dynamodb"),
            ("DYNAMODB_TABLE", "videos"),
        ])
        .unwrap();
        assert!(matches!(config.queue, QueueBackend::Sqs { .. }));
        assert_eq!(
            config.storage,
            StorageBackend::S3 {
                bucket: "videos".to_string()
            }
        );
        assert_eq!(
            config.videos,
            VideoStoreBackend::DynamoDb {
                table: "videos".to_string()
            }
        );
    }

    #[test]
    fn test_missing_queue_url() {
        assert_eq!(
            load(&[("QUEUE_BACKEND", "sqs")]).unwrap_err(),
            ConfigError::Missing("SQS_QUEUE_URL")
        );
    }

    #[test]
    fn test_blank_value_uses_default() {
        let config = load(&[("TASK_MAX_RETRY", "  ")]).unwrap();
        assert_eq!(config.task_policy.max_retry, 5);
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("TASK_MAX_RETRY", "3"),
            ("TASK_TIMEOUT_SECS", "120"),
            ("WORKER_COUNT", "4"),
            ("RETRY_BACKOFF_BASE_SECS", "0"),
            ("CLIP_MAX_SECONDS", "15"),
            ("CLIP_ASPECT", "4/3"),
        ])
        .unwrap();
        assert_eq!(config.task_policy.max_retry, 3);
        assert_eq!(config.task_policy.timeout, Duration::from_secs(120));
        assert_eq!(config.worker.count, 4);
        assert!(config.worker.backoff.base.is_zero());
        assert_eq!(config.transcode.options.max_duration, Duration::from_secs(15));
        assert_eq!(config.transcode.options.aspect, "4/3");
    }

    #[test]
    fn test_invalid_values() {
        assert!(matches!(
            load(&[("TASK_MAX_RETRY", "many")]),
            Err(ConfigError::Invalid {
                var: "TASK_MAX_RETRY",
                ..
            })
        ));
        assert!(matches!(
            load(&[("TASK_MAX_RETRY", "0")]),
            Err(ConfigError::Invalid { .. })
        ));
        assert!(matches!(
            load(&[("QUEUE_BACKEND", "kafka")]),
            Err(ConfigError::Invalid {
                var: "QUEUE_BACKEND",
                ..
            })
        ));
    }
}
