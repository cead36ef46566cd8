//! Ports - Trait definitions the application layer is generic over.

pub mod queue;
pub mod repository;
pub mod storage;
pub mod transcoder;
