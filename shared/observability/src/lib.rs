//! GraphRAG Observability Library
//!
//! Standardized tracing subscriber setup for the GraphRAG service binaries.
//!
//! # Features
//! - Structured JSON logging for production, pretty output for development
//! - `RUST_LOG`-compatible env-filter with sane defaults

pub mod init;

pub use init::*;

// Re-export tracing for convenience
pub use tracing::{debug, error, info, instrument, span, trace, warn, Level};
