//! Monolith Binary - single-host deployment
//!
//! Serves the upload API and runs the processing workers in one process.
//! With every backend set to `memory` it needs nothing but ffmpeg.

use reelworks::adapters::local::http;
use reelworks::bootstrap;
use reelworks::config::PipelineConfig;
use reelworks::telemetry;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
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

    // 1. Adapters
    let services = match bootstrap::connect(&config).await {
        Ok(services) => services,
        Err(e) => {
            error!(error = %e, "failed to connect backends");
            std::process::exit(1);
        }
    };

    // 2. Workers
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

    // 3. HTTP layer
    let intake = Arc::new(bootstrap::intake(&config, &services));
    let app = http::router(intake, config.http.max_upload_bytes);

    let bind = format!("{}:{}", config.http.addr, config.http.port);
    let listener = match tokio::net::TcpListener::bind(&bind).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(addr = %bind, error = %e, "failed to bind TCP listener");
            std::process::exit(1);
        }
    };
    info!(addr = %bind, "listening");

    let server_shutdown = shutdown.clone();
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::signal::ctrl_c().await.ok();
            info!("shutdown requested");
            server_shutdown.cancel();
        })
        .await;
    if let Err(e) = served {
        error!(error = %e, "server failed");
    }

    // the server may also stop on its own; workers drain either way
    shutdown.cancel();
    while let Some(joined) = workers.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "worker task failed");
        }
    }
    info!("all workers stopped");
}
