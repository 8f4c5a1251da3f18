//! Model resolution: the one external collaborator the engine consumes.
//!
//! Downloading and caching models is owned elsewhere. A resolver only
//! answers "is `model_id` ready, and where does its cache live".

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A model the loading layer has already downloaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedModel {
    pub model_id: String,
    /// HuggingFace cache root holding the model files (exported as `HF_HOME`).
    pub cache_dir: Option<PathBuf>,
}

impl ResolvedModel {
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            cache_dir: None,
        }
    }

    pub fn with_cache_dir(mut self, cache_dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(cache_dir.into());
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("model not downloaded or not ready: {model_id}")]
    NotReady { model_id: String },

    #[error("invalid model id: {model_id:?}")]
    InvalidId { model_id: String },

    #[error("model store unavailable: {0}")]
    Backend(String),
}

/// Looks up loaded models by id.
#[async_trait]
pub trait ModelResolver: Send + Sync {
    async fn resolve(&self, model_id: &str) -> Result<ResolvedModel, ResolveError>;
}

/// Resolver over a fixed set of ids sharing one cache directory.
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    models: BTreeSet<String>,
    cache_dir: Option<PathBuf>,
}

impl StaticResolver {
    pub fn new<I, S>(model_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            models: model_ids.into_iter().map(Into::into).collect(),
            cache_dir: None,
        }
    }

    pub fn with_cache_dir(mut self, cache_dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(cache_dir.into());
        self
    }
}

#[async_trait]
impl ModelResolver for StaticResolver {
    async fn resolve(&self, model_id: &str) -> Result<ResolvedModel, ResolveError> {
        if !self.models.contains(model_id) {
            return Err(ResolveError::NotReady {
                model_id: model_id.to_string(),
            });
        }
        Ok(ResolvedModel {
            model_id: model_id.to_string(),
            cache_dir: self.cache_dir.clone(),
        })
    }
}

/// Resolver backed by a HuggingFace cache directory on disk.
///
/// A model is ready when `<root>/hub/models--{org}--{name}` exists.
#[derive(Debug, Clone)]
pub struct CacheDirResolver {
    root: PathBuf,
}

impl CacheDirResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory the hub client stores `model_id` under.
    pub fn model_dir(&self, model_id: &str) -> Result<PathBuf, ResolveError> {
        let valid = !model_id.is_empty()
            && model_id.split('/').count() <= 2
            && model_id.split('/').all(|part| {
                !part.is_empty()
                    && part != "."
                    && part != ".."
                    && part
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            });
        if !valid {
            return Err(ResolveError::InvalidId {
                model_id: model_id.to_string(),
            });
        }
        let folder = format!("models--{}", model_id.replace('/', "--"));
        Ok(self.root.join("hub").join(folder))
    }
}

#[async_trait]
impl ModelResolver for CacheDirResolver {
    async fn resolve(&self, model_id: &str) -> Result<ResolvedModel, ResolveError> {
        let dir = self.model_dir(model_id)?;
        match tokio::fs::metadata(&dir).await {
            Ok(meta) if meta.is_dir() => {
                Ok(ResolvedModel::new(model_id).with_cache_dir(self.root.clone()))
            }
            Ok(_) => Err(ResolveError::NotReady {
                model_id: model_id.to_string(),
            }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(ResolveError::NotReady {
                    model_id: model_id.to_string(),
                })
            }
            Err(err) => Err(ResolveError::Backend(format!(
                "cannot inspect {}: {err}",
                dir.display()
            ))),
        }
    }
}
