//! Domain layer - Pure business logic.

// Task descriptors and the wire envelope shared by every queue backend
pub mod tasks;

// Video records and their status machine
pub mod videos;
