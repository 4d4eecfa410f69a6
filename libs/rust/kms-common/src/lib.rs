//! Shared library for cross-cutting concerns of the KMS plugin.
//!
//! This crate provides centralized implementations for:
//! - Error types with retryability classification
//! - HTTP client configuration with per-client default headers
//! - Fixed-increment polling bounded by a maximum total wait
//! - Tracing subscriber setup (text or JSON)

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod http;
pub mod poll;
pub mod tracing_config;

pub use error::PlatformError;
pub use http::{HttpConfig, build_http_client};
pub use poll::{PollConfig, PollPolicy};
pub use tracing_config::{TracingConfig, init_tracing};
