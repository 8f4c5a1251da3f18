//! Error types for the sandbox module.

use std::path::PathBuf;

use super::resolver::ResolveError;

/// Errors surfaced by the sandbox service to its caller.
///
/// User-code failures are not errors: they are
/// [`ExecutionOutcome::Failure`](super::outcome::ExecutionOutcome) values.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("submission rejected: {}", reasons.join("; "))]
    Rejected { reasons: Vec<String> },

    #[error("invalid request: {0}")]
    InvalidInput(String),

    #[error("model not available: {model_id}")]
    ModelUnavailable { model_id: String },

    #[error("internal error")]
    Internal,
}

impl SandboxError {
    /// HTTP-style status code for the caller-facing layer.
    pub fn status_code(&self) -> u16 {
        match self {
            SandboxError::Rejected { .. } => 422,
            SandboxError::InvalidInput(_) => 400,
            SandboxError::ModelUnavailable { .. } => 400,
            SandboxError::Internal => 500,
        }
    }

    /// Response body: `{"error": ...}`, plus `reasons` for rejections.
    pub fn to_body(&self) -> serde_json::Value {
        match self {
            SandboxError::Rejected { reasons } => serde_json::json!({
                "error": "submission rejected by validator",
                "reasons": reasons,
            }),
            other => serde_json::json!({ "error": other.to_string() }),
        }
    }
}

impl From<ResolveError> for SandboxError {
    fn from(err: ResolveError) -> Self {
        match err {
            ResolveError::NotReady { model_id } | ResolveError::InvalidId { model_id } => {
                SandboxError::ModelUnavailable { model_id }
            }
            ResolveError::Backend(_) => SandboxError::Internal,
        }
    }
}

/// Host-side faults inside the execution engine.
///
/// Never shown to callers; logged and replaced by a generic internal-error
/// outcome.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("cannot create working directory: {0}")]
    Workdir(#[source] std::io::Error),

    #[error("cannot start interpreter {python}: {source}")]
    Spawn {
        python: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("worker {0} pipe was not captured")]
    MissingPipe(&'static str),

    #[error("worker pipe failed: {0}")]
    Pipe(#[source] std::io::Error),

    #[error("waiting for worker failed: {0}")]
    Wait(#[source] std::io::Error),

    #[error("cannot encode execution context: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("output collection failed: {0}")]
    Collect(String),

    #[error("worker protocol error: {0}")]
    Protocol(String),
}

/// Result type for sandbox service operations.
pub type SandboxResult<T> = std::result::Result<T, SandboxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejection_lists_every_reason() {
        let err = SandboxError::Rejected {
            reasons: vec!["forbidden import: os".into(), "forbidden call: eval".into()],
        };
        assert_eq!(err.status_code(), 422);
        assert!(err.to_string().contains("forbidden import: os; forbidden call: eval"));
        assert_eq!(
            err.to_body(),
            serde_json::json!({
                "error": "submission rejected by validator",
                "reasons": ["forbidden import: os", "forbidden call: eval"],
            })
        );
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(SandboxError::InvalidInput("x".into()).status_code(), 400);
        assert_eq!(
            SandboxError::ModelUnavailable {
                model_id: "m".into()
            }
            .status_code(),
            400
        );
        assert_eq!(SandboxError::Internal.status_code(), 500);
    }

    #[test]
    fn test_internal_body_is_generic() {
        assert_eq!(
            SandboxError::Internal.to_body(),
            serde_json::json!({"error": "internal error"})
        );
    }

    #[test]
    fn test_resolve_errors_map_to_caller_or_internal() {
        let err: SandboxError = ResolveError::NotReady {
            model_id: "bert".into(),
        }
        .into();
        assert!(matches!(err, SandboxError::ModelUnavailable { ref model_id } if model_id == "bert"));

        let err: SandboxError = ResolveError::Backend("disk on fire".into()).into();
        assert!(matches!(err, SandboxError::Internal));
    }

    #[test]
    fn test_engine_error_display() {
        let err = EngineError::Spawn {
            python: PathBuf::from("/usr/bin/python3"),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
        };
        let msg = err.to_string();
        assert!(msg.contains("/usr/bin/python3"));
        assert!(msg.contains("no such file"));
    }
}
