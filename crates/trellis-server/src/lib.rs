//! HTTP surface for trellis.
//!
//! Thin request layer over `trellis-stream`: route parsing and
//! validation, SSE response plumbing, and the error-to-status mapping.
//! All turn semantics live in the orchestrator.

pub mod http;
pub mod loopback;
pub mod service;

pub use service::{ApiError, AppState};
