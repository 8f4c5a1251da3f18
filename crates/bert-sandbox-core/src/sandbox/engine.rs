//! Execution engine: runs accepted code in limited worker processes.
//!
//! Per item: acquire a working directory, launch a worker under
//! [`ResourceLimits`], interpret what it left behind, remove the directory.
//! Host-side faults never reach the caller as anything but a generic
//! `internal_error` outcome.

use std::path::PathBuf;
use std::time::Instant;

use tracing::debug;

use super::error::EngineError;
use super::limits::ResourceLimits;
use super::outcome::ExecutionOutcome;
use super::resolver::ResolvedModel;
use super::validator::AcceptedCode;
use super::workdir::WorkDir;
use super::worker::{interpret, run_worker, ExecutionContext, WorkerExit, WorkerLaunch};
use crate::obs;

/// Default cap on a worker's reply line.
pub const DEFAULT_MAX_REPLY_BYTES: usize = 16 * 1024 * 1024;

/// Default cap on failure messages, in characters.
pub const DEFAULT_MAX_MESSAGE_CHARS: usize = 2000;

#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    /// Interpreter used for workers.
    pub python: PathBuf,
    pub limits: ResourceLimits,
    /// Parent of per-item working directories; system temp dir when `None`.
    pub workdir_root: Option<PathBuf>,
    pub max_message_chars: usize,
    pub max_reply_bytes: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            python: PathBuf::from("python3"),
            limits: ResourceLimits::default(),
            workdir_root: None,
            max_message_chars: DEFAULT_MAX_MESSAGE_CHARS,
            max_reply_bytes: DEFAULT_MAX_REPLY_BYTES,
        }
    }
}

/// Runs [`AcceptedCode`] against a resolved model.
///
/// Holds no per-request state; share it behind an `Arc`.
#[derive(Debug, Clone, Default)]
pub struct ExecutionEngine {
    settings: EngineSettings,
}

impl ExecutionEngine {
    pub fn new(settings: EngineSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Run `custom_function` once on `input`.
    pub async fn execute(
        &self,
        code: &AcceptedCode,
        model: &ResolvedModel,
        input: &str,
    ) -> ExecutionOutcome {
        self.run_item(code, model, input, 0).await
    }

    /// Run `custom_function` once per input, sequentially, each in its own
    /// worker. Outcomes come back in input order.
    pub async fn execute_batch(
        &self,
        code: &AcceptedCode,
        model: &ResolvedModel,
        inputs: &[String],
    ) -> Vec<ExecutionOutcome> {
        let started = Instant::now();
        let mut outcomes = Vec::with_capacity(inputs.len());
        for (item, input) in inputs.iter().enumerate() {
            outcomes.push(self.run_item(code, model, input, item).await);
        }
        let failures = outcomes.iter().filter(|o| !o.is_success()).count();
        obs::emit_batch_finished(inputs.len(), failures, started.elapsed().as_millis() as u64);
        outcomes
    }

    async fn run_item(
        &self,
        code: &AcceptedCode,
        model: &ResolvedModel,
        input: &str,
        item: usize,
    ) -> ExecutionOutcome {
        obs::emit_execution_started(&model.model_id, item);
        let started = Instant::now();

        let outcome = match self.run_in_workdir(code, model, input).await {
            Ok(outcome) => outcome.bounded(self.settings.max_message_chars),
            Err(err) => {
                obs::emit_internal_error("engine", &err);
                ExecutionOutcome::internal()
            }
        };

        obs::emit_execution_finished(
            item,
            outcome.kind().map(|kind| kind.as_str()),
            started.elapsed().as_millis() as u64,
        );
        outcome
    }

    async fn run_in_workdir(
        &self,
        code: &AcceptedCode,
        model: &ResolvedModel,
        input: &str,
    ) -> Result<ExecutionOutcome, EngineError> {
        let workdir = WorkDir::acquire(self.settings.workdir_root.as_deref())
            .map_err(EngineError::Workdir)?;

        let launch = WorkerLaunch {
            python: &self.settings.python,
            workdir: workdir.path(),
            cache_dir: model.cache_dir.as_deref(),
            limits: self.settings.limits,
            max_reply_bytes: self.settings.max_reply_bytes,
        };
        let context = ExecutionContext::new(code, model, input);
        let exit = run_worker(&launch, &context).await;

        // Removed before the result is inspected, on every path.
        workdir.release();

        let exit = exit?;
        log_worker_stderr(&exit);
        interpret(&exit, &self.settings.limits)
    }
}

fn log_worker_stderr(exit: &WorkerExit) {
    if exit.stderr.bytes.is_empty() {
        return;
    }
    debug!(
        stderr = %String::from_utf8_lossy(&exit.stderr.bytes),
        truncated = exit.stderr.truncated,
        elapsed_ms = exit.elapsed.as_millis() as u64,
        "worker stderr"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::outcome::{ErrorKind, INTERNAL_ERROR_MESSAGE};
    use crate::sandbox::submission::SourceFragments;
    use crate::sandbox::validator::Validator;

    fn accepted() -> AcceptedCode {
        let code = SourceFragments::new(
            "tokenizer = None",
            "model = None",
            "def custom_function(text):\n    return {'length': len(text)}",
        );
        Validator::default().admit(&code).unwrap()
    }

    fn is_empty_dir(path: &std::path::Path) -> bool {
        std::fs::read_dir(path).unwrap().next().is_none()
    }

    #[test]
    fn test_default_settings() {
        let settings = EngineSettings::default();
        assert_eq!(settings.python, PathBuf::from("python3"));
        assert_eq!(settings.limits, ResourceLimits::default());
        assert_eq!(settings.max_message_chars, 2000);
        assert!(settings.workdir_root.is_none());
    }

    #[tokio::test]
    async fn test_missing_interpreter_is_an_internal_error() {
        let root = tempfile::tempdir().unwrap();
        let engine = ExecutionEngine::new(EngineSettings {
            python: PathBuf::from("/nonexistent/bin/python3"),
            workdir_root: Some(root.path().to_path_buf()),
            ..Default::default()
        });

        let outcome = engine
            .execute(&accepted(), &ResolvedModel::new("bert-base-uncased"), "hi")
            .await;

        assert_eq!(
            outcome,
            ExecutionOutcome::failure(ErrorKind::InternalError, INTERNAL_ERROR_MESSAGE)
        );
        assert!(is_empty_dir(root.path()), "working directory left behind");
    }

    #[tokio::test]
    async fn test_unusable_workdir_root_is_an_internal_error() {
        let scratch = tempfile::tempdir().unwrap();
        let not_a_dir = scratch.path().join("file");
        std::fs::write(&not_a_dir, b"x").unwrap();

        let engine = ExecutionEngine::new(EngineSettings {
            workdir_root: Some(not_a_dir),
            ..Default::default()
        });
        let outcome = engine
            .execute(&accepted(), &ResolvedModel::new("bert-base-uncased"), "hi")
            .await;
        assert_eq!(outcome.kind(), Some(ErrorKind::InternalError));
    }

    #[tokio::test]
    async fn test_batch_keeps_one_outcome_per_item() {
        let engine = ExecutionEngine::new(EngineSettings {
            python: PathBuf::from("/nonexistent/bin/python3"),
            ..Default::default()
        });
        let inputs = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let outcomes = engine
            .execute_batch(&accepted(), &ResolvedModel::new("m"), &inputs)
            .await;
        assert_eq!(outcomes.len(), 3);

        let outcomes = engine
            .execute_batch(&accepted(), &ResolvedModel::new("m"), &[])
            .await;
        assert!(outcomes.is_empty());
    }
}
