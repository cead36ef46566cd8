//! Enqueue Binary
//!
//! Issues a fresh processing task for an existing video, e.g. to retry a
//! video that failed or whose original enqueue was lost.
//!
//! Environment Variables:
//! - VIDEO_ID: id of the video to reprocess

use reelworks::bootstrap;
use reelworks::config::PipelineConfig;
use reelworks::telemetry;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let config = match PipelineConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };
    telemetry::init();

    let video_id: u64 = match std::env::var("VIDEO_ID").ok().and_then(|v| v.trim().parse().ok()) {
        Some(id) => id,
        None => {
            error!("VIDEO_ID env var required");
            std::process::exit(1);
        }
    };

    let services = match bootstrap::connect(&config).await {
        Ok(services) => services,
        Err(e) => {
            error!(error = %e, "failed to connect backends");
            std::process::exit(1);
        }
    };

    match bootstrap::intake(&config, &services).reissue(video_id).await {
        Ok(task_id) => info!(video_id, task_id = %task_id, "processing task enqueued"),
        Err(e) => {
            error!(video_id, error = %e, "failed to enqueue processing task");
            std::process::exit(1);
        }
    }
}
