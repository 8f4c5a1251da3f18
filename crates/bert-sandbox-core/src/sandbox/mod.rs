//! Sandbox: static validation and resource-limited execution of user code.
//!
//! A submission is parsed and walked against an allow/deny policy. Accepted
//! code runs in a fresh interpreter subprocess per item, with rlimits, a
//! wall-clock deadline and a private working directory.
//!
//! # Modules
//!
//! - [`submission`] : `CodeSubmission`, `SourceFragments`, `SubmissionInput`
//! - [`policy`]     : `ValidatorPolicy` allow-list and deny-lists
//! - [`validator`]  : `Validator`, `ValidationResult`, `AcceptedCode`
//! - [`limits`]     : `ResourceLimits` and their installation on a worker
//! - [`workdir`]    : scoped per-item working directories
//! - [`worker`]     : worker launch, deadline, reply interpretation
//! - [`engine`]     : `ExecutionEngine::execute` / `execute_batch`
//! - [`outcome`]    : `ExecutionOutcome`, `ErrorKind`, response bodies
//! - [`resolver`]   : `ModelResolver` and its implementations
//! - [`error`]      : `SandboxError` / `EngineError` / `SandboxResult`

pub mod engine;
pub mod error;
pub mod limits;
pub mod outcome;
pub mod policy;
pub mod resolver;
pub mod submission;
pub mod validator;
pub mod workdir;
pub mod worker;

pub use engine::{EngineSettings, ExecutionEngine};
pub use error::{EngineError, SandboxError, SandboxResult};
pub use limits::ResourceLimits;
pub use outcome::{BatchResponse, ErrorKind, ExecutionOutcome, ExecutionResponse};
pub use policy::ValidatorPolicy;
pub use resolver::{CacheDirResolver, ModelResolver, ResolveError, ResolvedModel, StaticResolver};
pub use submission::{CodeSubmission, Fragment, SourceFragments, SubmissionInput};
pub use validator::{AcceptedCode, ValidationResult, Validator};
pub use workdir::WorkDir;
