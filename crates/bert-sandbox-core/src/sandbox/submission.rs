//! Code submissions: the tokenizer/model/function triple plus its input.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Which of the three source fragments a piece of code came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Fragment {
    Tokenizer,
    Model,
    Function,
}

impl Fragment {
    /// Field name of the fragment in a submission payload.
    pub fn as_str(&self) -> &'static str {
        match self {
            Fragment::Tokenizer => "tokenizer_code",
            Fragment::Model => "model_code",
            Fragment::Function => "function_code",
        }
    }
}

impl std::fmt::Display for Fragment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The three user-authored source fragments of one submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFragments {
    pub tokenizer_code: String,
    pub model_code: String,
    pub function_code: String,
}

impl SourceFragments {
    pub fn new(
        tokenizer_code: impl Into<String>,
        model_code: impl Into<String>,
        function_code: impl Into<String>,
    ) -> Self {
        Self {
            tokenizer_code: tokenizer_code.into(),
            model_code: model_code.into(),
            function_code: function_code.into(),
        }
    }

    /// Fragments in execution order.
    pub fn iter(&self) -> impl Iterator<Item = (Fragment, &str)> {
        [
            (Fragment::Tokenizer, self.tokenizer_code.as_str()),
            (Fragment::Model, self.model_code.as_str()),
            (Fragment::Function, self.function_code.as_str()),
        ]
        .into_iter()
    }

    /// SHA-256 over all three fragments, hex encoded.
    ///
    /// Fragments are length-prefixed so that moving text between them
    /// changes the digest.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        for (_, source) in self.iter() {
            hasher.update((source.len() as u64).to_le_bytes());
            hasher.update(source.as_bytes());
        }
        hex::encode(hasher.finalize())
    }
}

/// Input of a submission: one text, or an ordered list of texts for batch mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SubmissionInput {
    Single(String),
    Batch(Vec<String>),
}

impl SubmissionInput {
    pub fn is_batch(&self) -> bool {
        matches!(self, SubmissionInput::Batch(_))
    }

    /// Number of items that will be executed.
    pub fn len(&self) -> usize {
        match self {
            SubmissionInput::Single(_) => 1,
            SubmissionInput::Batch(items) => items.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<&str> for SubmissionInput {
    fn from(text: &str) -> Self {
        SubmissionInput::Single(text.to_string())
    }
}

impl From<String> for SubmissionInput {
    fn from(text: String) -> Self {
        SubmissionInput::Single(text)
    }
}

impl From<Vec<String>> for SubmissionInput {
    fn from(items: Vec<String>) -> Self {
        SubmissionInput::Batch(items)
    }
}

/// One caller request: code, input(s) and the model it runs against.
///
/// Immutable once received and discarded after the response is sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeSubmission {
    #[serde(flatten)]
    pub code: SourceFragments,
    pub input: SubmissionInput,
    pub model_id: String,
}

impl CodeSubmission {
    pub fn new(
        code: SourceFragments,
        input: impl Into<SubmissionInput>,
        model_id: impl Into<String>,
    ) -> Self {
        Self {
            code,
            input: input.into(),
            model_id: model_id.into(),
        }
    }
}
