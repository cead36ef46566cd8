//! In-process adapters.
//!
//! Always compiled. They back the single-process monolith when no external
//! services are configured and they are the fixtures the application tests
//! run against.

mod queue;
mod repository;
mod storage;

pub use queue::MemoryQueue;
pub use repository::MemoryVideoStore;
pub use storage::MemoryObjectStore;
