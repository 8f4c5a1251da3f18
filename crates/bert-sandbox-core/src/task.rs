//! Saved custom tasks: a named, reusable submission.
//!
//! Persistence is the caller's concern; this module only owns the record,
//! its field limits and the conversion into a runnable submission.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::sandbox::submission::{CodeSubmission, SourceFragments, SubmissionInput};

pub const MAX_NAME_CHARS: usize = 100;
pub const MAX_DESCRIPTION_CHARS: usize = 500;
pub const MAX_TAGS_CHARS: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    #[error("{field} must not be empty")]
    Empty { field: &'static str },

    #[error("{field} is {actual} characters long, the limit is {max}")]
    TooLong {
        field: &'static str,
        max: usize,
        actual: usize,
    },
}

/// A stored submission template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomTask {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub model_id: String,
    #[serde(flatten)]
    pub code: SourceFragments,
    /// Comma-separated labels.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<String>,
    /// Whether the task is meant to be run over a list of inputs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_mode: Option<bool>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CustomTask {
    /// Create a task with a fresh id and both timestamps set to now.
    pub fn new(
        name: impl Into<String>,
        model_id: impl Into<String>,
        code: SourceFragments,
    ) -> Result<Self, TaskError> {
        let now = Utc::now();
        let task = Self {
            id: Some(Uuid::new_v4().to_string()),
            name: name.into(),
            description: String::new(),
            model_id: model_id.into(),
            code,
            tags: None,
            batch_mode: None,
            created_at: now,
            updated_at: now,
        };
        task.validate()?;
        Ok(task)
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_tags(mut self, tags: impl Into<String>) -> Self {
        self.tags = Some(tags.into());
        self
    }

    pub fn with_batch_mode(mut self, batch_mode: bool) -> Self {
        self.batch_mode = Some(batch_mode);
        self
    }

    /// Check the field limits.
    pub fn validate(&self) -> Result<(), TaskError> {
        if self.name.trim().is_empty() {
            return Err(TaskError::Empty { field: "name" });
        }
        if self.model_id.trim().is_empty() {
            return Err(TaskError::Empty { field: "model_id" });
        }
        check_len("name", &self.name, MAX_NAME_CHARS)?;
        check_len("description", &self.description, MAX_DESCRIPTION_CHARS)?;
        if let Some(tags) = &self.tags {
            check_len("tags", tags, MAX_TAGS_CHARS)?;
        }
        Ok(())
    }

    /// Trimmed, non-empty tags.
    pub fn tag_list(&self) -> Vec<&str> {
        self.tags
            .as_deref()
            .map(|tags| {
                tags.split(',')
                    .map(str::trim)
                    .filter(|tag| !tag.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Replace the code and bump `updated_at`.
    pub fn update_code(&mut self, code: SourceFragments) {
        self.code = code;
        self.updated_at = Utc::now();
    }

    /// Build a submission running this task on `input`.
    pub fn into_submission(self, input: impl Into<SubmissionInput>) -> CodeSubmission {
        CodeSubmission::new(self.code, input, self.model_id)
    }
}

fn check_len(field: &'static str, value: &str, max: usize) -> Result<(), TaskError> {
    let actual = value.chars().count();
    if actual > max {
        return Err(TaskError::TooLong { field, max, actual });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn code() -> SourceFragments {
        SourceFragments::new(
            "tokenizer = None",
            "model = None",
            "def custom_function(text):\n    return len(text)",
        )
    }

    #[test]
    fn test_new_task_has_id_and_timestamps() {
        let task = CustomTask::new("Sentiment", "bert-base-uncased", code()).unwrap();
        assert!(task.id.is_some());
        assert_eq!(task.created_at, task.updated_at);
        assert!(task.description.is_empty());
    }

    #[test]
    fn test_required_fields() {
        assert_eq!(
            CustomTask::new("  ", "bert-base-uncased", code()).unwrap_err(),
            TaskError::Empty { field: "name" }
        );
        assert_eq!(
            CustomTask::new("Sentiment", "", code()).unwrap_err(),
            TaskError::Empty { field: "model_id" }
        );
    }

    #[test]
    fn test_length_limits() {
        let long_name = "n".repeat(MAX_NAME_CHARS + 1);
        assert_eq!(
            CustomTask::new(long_name, "m", code()).unwrap_err(),
            TaskError::TooLong {
                field: "name",
                max: 100,
                actual: 101
            }
        );

        let task = CustomTask::new("ok", "m", code())
            .unwrap()
            .with_description("d".repeat(MAX_DESCRIPTION_CHARS + 1));
        assert!(matches!(
            task.validate(),
            Err(TaskError::TooLong {
                field: "description",
                ..
            })
        ));

        let task = CustomTask::new("ok", "m", code())
            .unwrap()
            .with_tags("t".repeat(MAX_TAGS_CHARS));
        task.validate().unwrap();
    }

    #[test]
    fn test_limits_count_characters_not_bytes() {
        let name = "é".repeat(MAX_NAME_CHARS);
        CustomTask::new(name, "m", code()).unwrap();
    }

    #[test]
    fn test_tag_list() {
        let task = CustomTask::new("ok", "m", code())
            .unwrap()
            .with_tags("sentiment, reviews,, en ");
        assert_eq!(task.tag_list(), vec!["sentiment", "reviews", "en"]);

        let untagged = CustomTask::new("ok", "m", code()).unwrap();
        assert!(untagged.tag_list().is_empty());
    }

    #[test]
    fn test_update_code_bumps_updated_at() {
        let mut task = CustomTask::new("ok", "m", code()).unwrap();
        let created = task.created_at;
        task.update_code(SourceFragments::new(
            "tokenizer = 1",
            "model = 2",
            "def custom_function(t):\n    return t",
        ));
        assert!(task.updated_at >= created);
        assert_eq!(task.code.tokenizer_code, "tokenizer = 1");
    }

    #[test]
    fn test_into_submission() {
        let task = CustomTask::new("Sentiment", "bert-base-uncased", code()).unwrap();
        let submission = task
            .clone()
            .into_submission(vec!["a".to_string(), "b".to_string()]);
        assert_eq!(submission.model_id, "bert-base-uncased");
        assert_eq!(submission.code, task.code);
        assert!(submission.input.is_batch());
    }

    #[test]
    fn test_json_shape_is_flat() {
        let task = CustomTask::new("Sentiment", "bert-base-uncased", code())
            .unwrap()
            .with_batch_mode(true);
        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["function_code"], task.code.function_code.as_str());
        assert_eq!(json["batch_mode"], true);
        assert!(json.get("tags").is_none());

        let back: CustomTask = serde_json::from_value(json).unwrap();
        assert_eq!(back, task);
    }
}
