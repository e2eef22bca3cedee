//! Sift Engine Library
//!
//! Question-to-result pipeline over uploaded CSV files. Used by the `sift`
//! binary and by integration tests.

/// Configuration management module
pub mod config;

/// Secret management module
pub mod secrets;

/// Static policy gate for generated code
pub mod policy;

/// Isolated execution of generated code
pub mod sandbox;

/// CSV loading and schema inference
pub mod datasets;

/// Database persistence module
pub mod db;

/// Rate limiting module
pub mod rate_limiter;

/// LLM provider abstraction layer
pub mod llm;

/// Fingerprinted result cache
pub mod cache;

/// Pipeline orchestration module
pub mod conductor;

/// Validation, rate limiting and run recording around the conductor
pub mod service;

/// Telemetry and Observability
pub mod telemetry;

/// CLI interface module
pub mod cli;

/// Command handlers module
pub mod handlers;
