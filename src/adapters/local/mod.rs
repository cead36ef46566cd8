//! Local adapters for single-host deployment.

pub mod fs;
pub mod http;
pub mod redis;

pub use fs::FsAdapter;
pub use redis::{RedisPool, RedisQueue};
