//! Caller-facing sandbox operations.
//!
//! Every path validates first. Rejected code never reaches the resolver or
//! the engine. [`SandboxService::handle`] turns a request into an HTTP-shaped
//! status and JSON body.

use serde::Serialize;
use serde_json::{json, Value};
use tracing::Instrument;
use uuid::Uuid;

use crate::config::SandboxSettings;
use crate::obs;
use crate::sandbox::engine::ExecutionEngine;
use crate::sandbox::error::{SandboxError, SandboxResult};
use crate::sandbox::outcome::{BatchResponse, ErrorKind, ExecutionOutcome};
use crate::sandbox::resolver::{ModelResolver, ResolveError, ResolvedModel};
use crate::sandbox::submission::{CodeSubmission, SourceFragments, SubmissionInput};
use crate::sandbox::validator::{AcceptedCode, ValidationResult, Validator};

/// Default cap on batch length.
pub const DEFAULT_MAX_BATCH_ITEMS: usize = 256;

/// Status code plus JSON body, ready for any transport.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Value,
}

impl ApiResponse {
    pub fn ok(body: Value) -> Self {
        Self { status: 200, body }
    }

    pub fn from_error(err: &SandboxError) -> Self {
        Self {
            status: err.status_code(),
            body: err.to_body(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Validator, engine and model resolver wired together.
pub struct SandboxService<R> {
    validator: Validator,
    engine: ExecutionEngine,
    resolver: R,
    max_batch_items: usize,
}

impl<R: ModelResolver> SandboxService<R> {
    pub fn new(validator: Validator, engine: ExecutionEngine, resolver: R) -> Self {
        Self {
            validator,
            engine,
            resolver,
            max_batch_items: DEFAULT_MAX_BATCH_ITEMS,
        }
    }

    pub fn from_settings(settings: &SandboxSettings, resolver: R) -> Self {
        Self::new(
            Validator::new(settings.policy.clone()),
            ExecutionEngine::new(settings.engine_settings()),
            resolver,
        )
        .with_max_batch_items(settings.max_batch_items)
    }

    pub fn with_max_batch_items(mut self, max_batch_items: usize) -> Self {
        self.max_batch_items = max_batch_items;
        self
    }

    pub fn validator(&self) -> &Validator {
        &self.validator
    }

    pub fn engine(&self) -> &ExecutionEngine {
        &self.engine
    }

    /// Static check only; nothing runs.
    pub fn validate(&self, submission: &CodeSubmission) -> ValidationResult {
        self.validator.validate_submission(submission)
    }

    /// Validate, resolve the model, then run `custom_function` on `input`.
    pub async fn execute(
        &self,
        code: &SourceFragments,
        input: &str,
        model_id: &str,
    ) -> SandboxResult<ExecutionOutcome> {
        let accepted = self.admit(code)?;
        let model = self.resolve(model_id).await?;
        let span = obs::execution_span(&new_execution_id(), model_id, accepted.digest());
        Ok(self
            .engine
            .execute(&accepted, &model, input)
            .instrument(span)
            .await)
    }

    /// Like [`execute`](Self::execute), once per input, in input order.
    pub async fn execute_batch(
        &self,
        code: &SourceFragments,
        inputs: &[String],
        model_id: &str,
    ) -> SandboxResult<Vec<ExecutionOutcome>> {
        let accepted = self.admit(code)?;
        if inputs.len() > self.max_batch_items {
            return Err(SandboxError::InvalidInput(format!(
                "batch has {} items, the limit is {}",
                inputs.len(),
                self.max_batch_items
            )));
        }
        if inputs.is_empty() {
            return Ok(Vec::new());
        }
        let model = self.resolve(model_id).await?;
        let span = obs::execution_span(&new_execution_id(), model_id, accepted.digest());
        Ok(self
            .engine
            .execute_batch(&accepted, &model, inputs)
            .instrument(span)
            .await)
    }

    /// Run a whole request and shape the response.
    ///
    /// * rejection: 422 with `{"error", "reasons"}`
    /// * unknown model or bad request: 400
    /// * single input: 200 with `{"result"}` or `{"error", "error_kind"}`,
    ///   500 when the failure is host-side
    /// * batch: 200 with `{"results", "errors", "error_kinds"}`
    pub async fn handle(&self, submission: &CodeSubmission) -> ApiResponse {
        if submission.model_id.trim().is_empty() {
            return ApiResponse::from_error(&SandboxError::InvalidInput(
                "model_id must be a non-empty string".to_string(),
            ));
        }

        match &submission.input {
            SubmissionInput::Single(input) => {
                match self
                    .execute(&submission.code, input, &submission.model_id)
                    .await
                {
                    Ok(outcome) => single_response(outcome),
                    Err(err) => ApiResponse::from_error(&err),
                }
            }
            SubmissionInput::Batch(inputs) => {
                match self
                    .execute_batch(&submission.code, inputs, &submission.model_id)
                    .await
                {
                    Ok(outcomes) => batch_response(outcomes),
                    Err(err) => ApiResponse::from_error(&err),
                }
            }
        }
    }

    fn admit(&self, code: &SourceFragments) -> SandboxResult<AcceptedCode> {
        match self.validator.admit(code) {
            Ok(accepted) => {
                obs::emit_submission_validated(accepted.digest(), true, 0);
                Ok(accepted)
            }
            Err(reasons) => {
                obs::emit_submission_validated(&code.digest(), false, reasons.len());
                Err(SandboxError::Rejected { reasons })
            }
        }
    }

    async fn resolve(&self, model_id: &str) -> SandboxResult<ResolvedModel> {
        self.resolver.resolve(model_id).await.map_err(|err| {
            if matches!(err, ResolveError::Backend(_)) {
                obs::emit_internal_error("resolve", &err);
            }
            SandboxError::from(err)
        })
    }
}

fn new_execution_id() -> String {
    Uuid::new_v4().to_string()
}

fn single_response(outcome: ExecutionOutcome) -> ApiResponse {
    let status = match outcome.kind() {
        Some(ErrorKind::InternalError) => 500,
        _ => 200,
    };
    let body = serde_json::to_value(outcome.into_response())
        .unwrap_or_else(|_| json!({ "error": "internal error" }));
    ApiResponse { status, body }
}

fn batch_response(outcomes: Vec<ExecutionOutcome>) -> ApiResponse {
    let response: BatchResponse = outcomes.into_iter().collect();
    let body =
        serde_json::to_value(response).unwrap_or_else(|_| json!({ "error": "internal error" }));
    ApiResponse::ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::engine::EngineSettings;
    use crate::sandbox::resolver::StaticResolver;
    use std::path::PathBuf;

    const GOOD_FUNCTION: &str = "def custom_function(text):\n    return {'n': len(text)}";

    /// Engine whose interpreter does not exist: anything that reaches it
    /// comes back as an internal error.
    fn service() -> SandboxService<StaticResolver> {
        let engine = ExecutionEngine::new(EngineSettings {
            python: PathBuf::from("/nonexistent/bin/python3"),
            ..Default::default()
        });
        SandboxService::new(
            Validator::default(),
            engine,
            StaticResolver::new(["bert-base-uncased"]),
        )
        .with_max_batch_items(2)
    }

    fn code(function_code: &str) -> SourceFragments {
        SourceFragments::new("tokenizer = None", "model = None", function_code)
    }

    #[tokio::test]
    async fn test_rejection_is_422_with_reasons() {
        let submission = CodeSubmission::new(
            code("import os\ndef custom_function(text):\n    return os.getcwd()"),
            "hi",
            "bert-base-uncased",
        );
        let response = service().handle(&submission).await;
        assert_eq!(response.status, 422);
        assert_eq!(response.body["reasons"], json!(["forbidden import: os"]));
    }

    #[tokio::test]
    async fn test_rejection_wins_over_unknown_model() {
        let err = service()
            .execute(&code("eval('1')"), "hi", "unknown-model")
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Rejected { .. }));
    }

    #[tokio::test]
    async fn test_unknown_model_is_400() {
        let submission = CodeSubmission::new(code(GOOD_FUNCTION), "hi", "roberta-base");
        let response = service().handle(&submission).await;
        assert_eq!(response.status, 400);
        assert!(response.body["error"]
            .as_str()
            .unwrap()
            .contains("roberta-base"));
    }

    #[tokio::test]
    async fn test_blank_model_id_is_400() {
        let submission = CodeSubmission::new(code(GOOD_FUNCTION), "hi", " ");
        assert_eq!(service().handle(&submission).await.status, 400);
    }

    #[tokio::test]
    async fn test_host_fault_is_500_with_generic_message() {
        let submission = CodeSubmission::new(code(GOOD_FUNCTION), "hi", "bert-base-uncased");
        let response = service().handle(&submission).await;
        assert_eq!(response.status, 500);
        assert_eq!(
            response.body,
            json!({
                "error": crate::sandbox::outcome::INTERNAL_ERROR_MESSAGE,
                "error_kind": "internal_error",
            })
        );
    }

    #[tokio::test]
    async fn test_oversized_batch_is_400() {
        let inputs: Vec<String> = vec!["a".into(), "b".into(), "c".into()];
        let err = service()
            .execute_batch(&code(GOOD_FUNCTION), &inputs, "bert-base-uncased")
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 400);
    }

    #[tokio::test]
    async fn test_empty_batch_is_empty_result() {
        let submission =
            CodeSubmission::new(code(GOOD_FUNCTION), Vec::<String>::new(), "bert-base-uncased");
        let response = service().handle(&submission).await;
        assert_eq!(response.status, 200);
        assert_eq!(
            response.body,
            json!({"results": [], "errors": [], "error_kinds": []})
        );
    }

    #[test]
    fn test_validate_does_not_need_a_model() {
        let submission = CodeSubmission::new(code(GOOD_FUNCTION), "hi", "anything");
        assert!(service().validate(&submission).is_accepted());
    }

    #[test]
    fn test_from_settings_uses_policy_and_cap() {
        let settings = SandboxSettings {
            max_batch_items: 3,
            ..Default::default()
        };
        let service = SandboxService::from_settings(&settings, StaticResolver::default());
        assert_eq!(service.max_batch_items, 3);
        assert_eq!(service.validator().policy(), &settings.policy);
        assert_eq!(service.engine().settings(), &settings.engine_settings());
    }
}
