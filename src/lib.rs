//! Reelworks - Video Processing Pipeline
//!
//! Uploaded videos are queued as tasks and transcoded by workers with
//! at-least-once delivery, bounded retries and a terminal failed state.
//!
//! Hexagonal Architecture:
//! - domain/: Tasks, videos and their state machine
//! - ports/: Queue, video store, object store and transcoder traits
//! - adapters/: Concrete implementations (memory, ffmpeg, Redis, filesystem, AWS)
//! - application/: Generic services (task processor, intake)
//! - config / bootstrap: Environment configuration and backend wiring
//!
//! # Features
//! - `local`: Redis queue and video store, filesystem object store, HTTP intake
//! - `aws`: SQS queue, S3 object store, DynamoDB video store
//! - `full`: All features

pub mod adapters;
pub mod application;
pub mod bootstrap;
pub mod config;
pub mod domain;
pub mod ports;
pub mod telemetry;

pub use config::PipelineConfig;
