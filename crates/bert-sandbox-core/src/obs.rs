//! Structured observability hooks for sandbox executions.
//!
//! This module provides:
//! - A request-scoped tracing span via [`execution_span`]
//! - Emission functions for lifecycle events: validation, start, finish, batch
//!
//! Events are emitted at `info!` level (filter with `BERT_SANDBOX_LOG` or
//! `RUST_LOG`). For JSON output pass `--json` to the CLI.

use std::path::Path;

use tracing::{info, warn};

/// Request-scoped span tagging every log line of one execution.
///
/// # Example
///
/// ```ignore
/// let span = execution_span(&execution_id, "bert-base-uncased", &digest);
/// engine.execute(&code, &model, input).instrument(span).await;
/// ```
pub fn execution_span(execution_id: &str, model_id: &str, digest: &str) -> tracing::Span {
    tracing::info_span!(
        "bert_sandbox.execution",
        execution_id = %execution_id,
        model_id = %model_id,
        digest = %digest,
    )
}

/// Emit event: validator verdict for a submission.
pub fn emit_submission_validated(digest: &str, accepted: bool, reasons: usize) {
    info!(
        event = "submission.validated",
        digest = %digest,
        accepted = accepted,
        reasons = reasons,
    );
}

/// Emit event: one worker is about to run.
pub fn emit_execution_started(model_id: &str, item: usize) {
    info!(event = "execution.started", model_id = %model_id, item = item);
}

/// Emit event: one worker finished. `kind` is `None` on success.
pub fn emit_execution_finished(item: usize, kind: Option<&str>, duration_ms: u64) {
    info!(
        event = "execution.finished",
        item = item,
        success = kind.is_none(),
        kind = kind.unwrap_or("none"),
        duration_ms = duration_ms,
    );
}

/// Emit event: a whole batch finished.
pub fn emit_batch_finished(total: usize, failures: usize, duration_ms: u64) {
    info!(
        event = "batch.finished",
        total = total,
        failures = failures,
        duration_ms = duration_ms,
    );
}

/// Emit event: a worker's working directory could not be removed (warning level).
pub fn emit_workdir_cleanup_failed(path: &Path, error: &dyn std::fmt::Display) {
    warn!(
        event = "workdir.cleanup_failed",
        path = %path.display(),
        error = %error,
    );
}

/// Emit event: host-side fault hidden behind a generic internal error.
pub fn emit_internal_error(stage: &str, error: &dyn std::fmt::Display) {
    tracing::error!(event = "execution.internal_error", stage = %stage, error = %error);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_span_create() {
        let _entered = execution_span("exec-1", "bert-base-uncased", "abc123").entered();
        emit_execution_started("bert-base-uncased", 0);
        emit_execution_finished(0, Some("runtime_error"), 12);
    }
}
