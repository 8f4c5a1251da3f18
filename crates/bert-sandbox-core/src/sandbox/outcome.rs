//! Execution outcomes and their caller-facing JSON shapes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Stable, machine-readable failure kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Static rejection; produced by the validator, never by the engine.
    ValidationError,
    /// `tokenizer_code` / `model_code` (or defining the function) failed.
    SyntaxOrNameError,
    /// `custom_function` raised.
    RuntimeError,
    /// The wall-clock or CPU budget ran out.
    TimeoutError,
    /// Memory or file-size ceiling hit.
    ResourceLimitError,
    /// The return value could not be encoded as JSON.
    SerializationError,
    /// Host-side fault, not attributable to user code.
    InternalError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ValidationError => "validation_error",
            ErrorKind::SyntaxOrNameError => "syntax_or_name_error",
            ErrorKind::RuntimeError => "runtime_error",
            ErrorKind::TimeoutError => "timeout_error",
            ErrorKind::ResourceLimitError => "resource_limit_error",
            ErrorKind::SerializationError => "serialization_error",
            ErrorKind::InternalError => "internal_error",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Generic message for host-side faults; details only go to the log.
pub const INTERNAL_ERROR_MESSAGE: &str = "internal error while executing submission";

/// Result of running `custom_function` on one input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Success { value: Value },
    Failure { kind: ErrorKind, message: String },
}

impl ExecutionOutcome {
    pub fn success(value: Value) -> Self {
        ExecutionOutcome::Success { value }
    }

    pub fn failure(kind: ErrorKind, message: impl Into<String>) -> Self {
        ExecutionOutcome::Failure {
            kind,
            message: message.into(),
        }
    }

    pub fn internal() -> Self {
        Self::failure(ErrorKind::InternalError, INTERNAL_ERROR_MESSAGE)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionOutcome::Success { .. })
    }

    /// Failure kind, `None` on success.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            ExecutionOutcome::Success { .. } => None,
            ExecutionOutcome::Failure { kind, .. } => Some(*kind),
        }
    }

    /// Truncate the failure message to `max_chars` characters.
    pub fn bounded(self, max_chars: usize) -> Self {
        match self {
            ExecutionOutcome::Failure { kind, message } => ExecutionOutcome::Failure {
                kind,
                message: bound_message(&message, max_chars),
            },
            success => success,
        }
    }

    pub fn into_response(self) -> ExecutionResponse {
        match self {
            ExecutionOutcome::Success { value } => ExecutionResponse {
                result: Some(value),
                error: None,
                error_kind: None,
            },
            ExecutionOutcome::Failure { kind, message } => ExecutionResponse {
                result: None,
                error: Some(message),
                error_kind: Some(kind),
            },
        }
    }
}

/// Cut `message` to at most `max_chars` characters, marking the cut.
pub fn bound_message(message: &str, max_chars: usize) -> String {
    const MARKER: &str = "...";
    if message.chars().count() <= max_chars {
        return message.to_string();
    }
    let keep = max_chars.saturating_sub(MARKER.len());
    let mut bounded: String = message.chars().take(keep).collect();
    bounded.push_str(MARKER);
    bounded
}

/// Single-item response body: `{"result": ...}` or `{"error": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

/// Batch response body: parallel arrays with `null` in the unused slot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchResponse {
    pub results: Vec<Option<Value>>,
    pub errors: Vec<Option<String>>,
    pub error_kinds: Vec<Option<ErrorKind>>,
}

impl FromIterator<ExecutionOutcome> for BatchResponse {
    fn from_iter<I: IntoIterator<Item = ExecutionOutcome>>(outcomes: I) -> Self {
        let mut response = BatchResponse::default();
        for outcome in outcomes {
            let item = outcome.into_response();
            response.results.push(item.result);
            response.errors.push(item.error);
            response.error_kinds.push(item.error_kind);
        }
        response
    }
}
