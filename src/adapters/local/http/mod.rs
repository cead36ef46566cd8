//! HTTP inbound adapter.
//!
//! A thin axum surface over `IntakeService`: upload, view and withdraw
//! videos. The caller's identity comes from the `X-User-Id` header.

mod videos;

pub use videos::{router, USER_HEADER};
