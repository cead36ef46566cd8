//! Application layer - Generic services that use ports.

pub mod backoff;
pub mod intake;
pub mod pipeline;
pub mod processor;
pub mod producer;
