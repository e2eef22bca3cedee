//! Conductor
//!
//! Turns a question about uploaded tables into a validated, executed and
//! explained result: classify, plan, generate, validate, execute, explain.

pub mod classifier;
pub mod explainer;
pub mod generator;
pub mod orchestrator;
pub mod planner;
pub mod route;
pub mod state;
pub mod structured;

pub use classifier::{select_files, Classification, IntentClassifier};
pub use explainer::{Explainer, Explanation};
pub use generator::{CodeGenerator, GenerationContext, GenerationError};
pub use orchestrator::{Conductor, ConductorSettings};
pub use planner::Planner;
pub use route::{route, Route};
pub use state::{
    AnalysisState, CodeValidity, FailureKind, FailureRecord, FinalResult, Intent,
    OperationType, Plan, Stage, StatePatch, TerminalError,
};
pub use structured::StructuredError;
