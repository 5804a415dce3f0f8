//! Shared helpers: tracing bootstrap, retry backoff, OTel instruments.

pub mod bootstrap;
#[cfg(feature = "otel")]
pub mod metrics;
pub mod retry;
