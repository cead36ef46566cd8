//! Worker Binary
//!
//! Runs `WORKER_COUNT` processing loops against the configured backends.
//! Ctrl-C stops receiving; tasks already in hand are finished first.
//!
//! Environment Variables:
//! - QUEUE_BACKEND / STORAGE_BACKEND / VIDEO_STORE: backend selection
//! - WORKER_COUNT: number of concurrent loops
//! - FFMPEG_BIN, INTRO_CLIP: transcoding inputs

use reelworks::bootstrap;
use reelworks::config::{PipelineConfig, QueueBackend};
use reelworks::telemetry;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

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

    if config.queue == QueueBackend::Memory {
        warn!("worker started with a memory queue; no producer can reach it");
    }

    let services = match bootstrap::connect(&config).await {
        Ok(services) => services,
        Err(e) => {
            error!(error = %e, "failed to connect backends");
            std::process::exit(1);
        }
    };
    let processor = match bootstrap::processor(&config, &services).await {
        Ok(processor) => Arc::new(processor),
        Err(e) => {
            error!(error = %e, "failed to build processor");
            std::process::exit(1);
        }
    };

    let shutdown = CancellationToken::new();
    let mut workers = JoinSet::new();
    for worker_id in 0..config.worker.count {
        let processor = processor.clone();
        let shutdown = shutdown.clone();
        workers.spawn(async move { processor.run(worker_id, shutdown).await });
    }
    info!(workers = config.worker.count, "started transcoding workers");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown requested, draining workers");
            shutdown.cancel();
        }
        _ = workers.join_next() => {
            error!("a worker exited unexpectedly, shutting down");
            shutdown.cancel();
        }
    }

    while let Some(joined) = workers.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "worker task failed");
        }
    }
    info!("all workers stopped");
}
