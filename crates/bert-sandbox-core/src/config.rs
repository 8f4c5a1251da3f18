//! Sandbox configuration: TOML file plus `BERT_SANDBOX_*` overrides.
//!
//! ```toml
//! python = "/usr/bin/python3"
//! max_batch_items = 64
//!
//! [limits]
//! time_limit_seconds = 10
//!
//! [policy]
//! allowed_modules = ["numpy", "torch", "transformers"]
//! ```
//!
//! Omitted keys keep their defaults. A `[policy]` table replaces the
//! standard lists wholesale for every list it names.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::sandbox::engine::{EngineSettings, DEFAULT_MAX_MESSAGE_CHARS, DEFAULT_MAX_REPLY_BYTES};
use crate::sandbox::limits::ResourceLimits;
use crate::sandbox::policy::ValidatorPolicy;

pub const ENV_PYTHON: &str = "BERT_SANDBOX_PYTHON";
pub const ENV_TIME_LIMIT_SECS: &str = "BERT_SANDBOX_TIME_LIMIT_SECS";
pub const ENV_MEMORY_LIMIT_BYTES: &str = "BERT_SANDBOX_MEMORY_LIMIT_BYTES";
pub const ENV_MAX_FILE_BYTES: &str = "BERT_SANDBOX_MAX_FILE_BYTES";
pub const ENV_WORKDIR_ROOT: &str = "BERT_SANDBOX_WORKDIR_ROOT";
pub const ENV_MODEL_CACHE_DIR: &str = "BERT_SANDBOX_MODEL_CACHE_DIR";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("{var} must be a non-negative integer, got {value:?}")]
    BadEnv { var: &'static str, value: String },

    #[error("invalid setting `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Everything the sandbox needs to know at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxSettings {
    /// Interpreter used for workers.
    pub python: PathBuf,
    pub limits: ResourceLimits,
    /// Parent directory of per-item working directories.
    pub workdir_root: Option<PathBuf>,
    /// HuggingFace cache root handed to workers as `HF_HOME`.
    pub model_cache_dir: Option<PathBuf>,
    pub policy: ValidatorPolicy,
    pub max_message_chars: usize,
    pub max_batch_items: usize,
    pub max_reply_bytes: usize,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            python: PathBuf::from("python3"),
            limits: ResourceLimits::default(),
            workdir_root: None,
            model_cache_dir: None,
            policy: ValidatorPolicy::standard(),
            max_message_chars: DEFAULT_MAX_MESSAGE_CHARS,
            max_batch_items: 256,
            max_reply_bytes: DEFAULT_MAX_REPLY_BYTES,
        }
    }
}

impl SandboxSettings {
    /// Load settings: defaults, then `path` if given, then the process
    /// environment. The result is validated.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut settings = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })?;
                Self::from_toml_str(&text)?
            }
            None => Self::default(),
        };
        settings.apply_env_overrides_from(|var| std::env::var(var).ok())?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Apply `BERT_SANDBOX_*` overrides read through `lookup`.
    ///
    /// Empty values are ignored.
    pub fn apply_env_overrides_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |var: &str| lookup(var).filter(|value| !value.trim().is_empty());

        if let Some(python) = get(ENV_PYTHON) {
            self.python = PathBuf::from(python);
        }
        if let Some(value) = get(ENV_TIME_LIMIT_SECS) {
            self.limits.time_limit_seconds = parse_env(ENV_TIME_LIMIT_SECS, &value)?;
        }
        if let Some(value) = get(ENV_MEMORY_LIMIT_BYTES) {
            self.limits.memory_limit_bytes = parse_env(ENV_MEMORY_LIMIT_BYTES, &value)?;
        }
        if let Some(value) = get(ENV_MAX_FILE_BYTES) {
            self.limits.max_output_file_bytes = parse_env(ENV_MAX_FILE_BYTES, &value)?;
        }
        if let Some(root) = get(ENV_WORKDIR_ROOT) {
            self.workdir_root = Some(PathBuf::from(root));
        }
        if let Some(cache) = get(ENV_MODEL_CACHE_DIR) {
            self.model_cache_dir = Some(PathBuf::from(cache));
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field: &'static str, reason: &str| -> Result<(), ConfigError> {
            Err(ConfigError::Invalid {
                field,
                reason: reason.to_string(),
            })
        };

        if self.python.as_os_str().is_empty() {
            return invalid("python", "interpreter path is empty");
        }
        if self.limits.time_limit_seconds == 0 {
            return invalid("limits.time_limit_seconds", "must be at least 1");
        }
        if self.limits.memory_limit_bytes == 0 {
            return invalid("limits.memory_limit_bytes", "must be positive");
        }
        if self.limits.max_output_file_bytes == 0 {
            return invalid("limits.max_output_file_bytes", "must be positive");
        }
        if self.policy.allowed_modules.is_empty() {
            return invalid("policy.allowed_modules", "allow-list is empty");
        }
        if self.max_message_chars == 0 {
            return invalid("max_message_chars", "must be positive");
        }
        if self.max_batch_items == 0 {
            return invalid("max_batch_items", "must be positive");
        }
        if self.max_reply_bytes == 0 {
            return invalid("max_reply_bytes", "must be positive");
        }
        Ok(())
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            python: self.python.clone(),
            limits: self.limits,
            workdir_root: self.workdir_root.clone(),
            max_message_chars: self.max_message_chars,
            max_reply_bytes: self.max_reply_bytes,
        }
    }
}

fn parse_env(var: &'static str, value: &str) -> Result<u64, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::BadEnv {
        var,
        value: value.to_string(),
    })
}
