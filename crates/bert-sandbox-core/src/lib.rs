//! BERT Studio code sandbox
//!
//! Validates user-submitted tokenizer / model / function snippets against a
//! restricted Python subset and runs accepted code in resource-limited
//! worker processes, returning structured results.

pub mod config;
pub mod obs;
pub mod sandbox;
pub mod service;
pub mod task;
pub mod telemetry;

pub use config::{ConfigError, SandboxSettings};
pub use sandbox::{
    AcceptedCode, BatchResponse, CacheDirResolver, CodeSubmission, EngineSettings, ErrorKind,
    ExecutionEngine, ExecutionOutcome, ExecutionResponse, ModelResolver, ResolveError,
    ResolvedModel, ResourceLimits, SandboxError, SandboxResult, SourceFragments, StaticResolver,
    SubmissionInput, ValidationResult, Validator, ValidatorPolicy,
};
pub use service::{ApiResponse, SandboxService};
pub use task::{CustomTask, TaskError};
pub use telemetry::init_tracing;

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
