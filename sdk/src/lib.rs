//! Sift SDK
//!
//! Shared types used by the engine and by collaborators that feed it:
//! tabular values, dataset descriptors, result shapes and the engine-level
//! error taxonomy.

/// Error types and handling
pub mod errors;

/// Tabular and dataset types
pub mod types;

// Re-export commonly used types
pub use errors::{EngineError, SiftErrorExt};
pub use types::{
    ColumnType, DatasetDescriptor, PeriodType, ResultValue, Scalar, Table, TableError,
    TabularResult,
};
