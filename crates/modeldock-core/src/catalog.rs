//! Model descriptor lookup: turns a model reference into a fetch location.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use url::Url;

use crate::config::CatalogConfig;
use crate::types::{ModelRef, ModelSource};

/// Where and what to fetch for one model artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub url: String,
    pub file_name: String,
    pub expected_size: Option<u64>,
    /// Lowercase hex SHA-256, verified before the artifact is finalized.
    pub sha256: Option<String>,
}

impl ModelDescriptor {
    /// Descriptor whose file name is the last segment of `url`.
    pub fn from_url(url: &str) -> Result<Self, CatalogError> {
        let file_name = file_name_from_url(url)
            .ok_or_else(|| CatalogError::Invalid(url.to_string(), "url has no file name".into()))?;
        Ok(Self {
            url: url.to_string(),
            file_name,
            expected_size: None,
            sha256: None,
        })
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.expected_size = Some(size);
        self
    }

    pub fn with_sha256(mut self, sha256: impl Into<String>) -> Self {
        self.sha256 = Some(sha256.into());
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("{0}")]
    NotFound(String),
    #[error("invalid model reference {0:?}: {1}")]
    Invalid(String, String),
    #[error("invalid base url {0:?}: {1}")]
    BaseUrl(String, url::ParseError),
}

#[async_trait]
pub trait ModelCatalog: Send + Sync {
    async fn resolve(&self, model: &ModelRef) -> Result<ModelDescriptor, CatalogError>;
}

/// Last non-empty path segment of a URL.
fn file_name_from_url(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let segment = parsed.path().split('/').filter(|s| !s.is_empty()).last()?;
    if segment == "." || segment == ".." {
        return None;
    }
    Some(segment.to_string())
}

/// Derives artifact URLs from the configured base URLs.
///
/// Hub models resolve to `<hub>/<id>/resolve/main/<artifact>`, runtime models
/// to `<runtime>/<id>/<artifact>`. Size and digest are learned from the source.
#[derive(Debug, Clone)]
pub struct HubCatalog {
    hub: Url,
    runtime: Url,
    default_artifact: String,
}

impl HubCatalog {
    pub fn new(config: &CatalogConfig) -> Result<Self, CatalogError> {
        let parse = |s: &str| Url::parse(s).map_err(|e| CatalogError::BaseUrl(s.to_string(), e));
        Ok(Self {
            hub: parse(&config.hub_base_url)?,
            runtime: parse(&config.runtime_base_url)?,
            default_artifact: config.default_artifact.clone(),
        })
    }

    fn artifact_url(&self, model: &ModelRef, artifact: &str) -> Result<Url, CatalogError> {
        let (base, infix): (&Url, &[&str]) = match model.source {
            ModelSource::RemoteHub => (&self.hub, &["resolve", "main"]),
            ModelSource::LocalRuntime => (&self.runtime, &[]),
        };
        let mut url = base.clone();
        {
            let mut segments = url.path_segments_mut().map_err(|_| {
                CatalogError::Invalid(base.to_string(), "base url cannot take a path".into())
            })?;
            segments.pop_if_empty();
            segments.extend(model.id.split('/'));
            segments.extend(infix.iter().copied());
            segments.push(artifact);
        }
        Ok(url)
    }
}

fn validate_id(id: &str) -> Result<(), CatalogError> {
    let invalid = |why: &str| Err(CatalogError::Invalid(id.to_string(), why.to_string()));
    if id.is_empty() {
        return invalid("empty id");
    }
    if id.split('/').any(|s| s.is_empty() || s == "." || s == "..") {
        return invalid("empty or relative path segment");
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | ':'))
    {
        return invalid("unsupported characters");
    }
    Ok(())
}

#[async_trait]
impl ModelCatalog for HubCatalog {
    async fn resolve(&self, model: &ModelRef) -> Result<ModelDescriptor, CatalogError> {
        validate_id(&model.id)?;
        let artifact = model
            .artifact
            .clone()
            .unwrap_or_else(|| self.default_artifact.clone());
        if artifact.is_empty() || artifact.contains('/') {
            return Err(CatalogError::Invalid(artifact, "artifact must be a file name".into()));
        }
        let url = self.artifact_url(model, &artifact)?;
        Ok(ModelDescriptor {
            url: url.to_string(),
            file_name: artifact,
            expected_size: None,
            sha256: None,
        })
    }
}

/// Fixed set of pinned descriptors.
#[derive(Debug, Default)]
pub struct StaticCatalog {
    entries: RwLock<HashMap<(ModelSource, String), ModelDescriptor>>,
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, model: &ModelRef, descriptor: ModelDescriptor) {
        self.entries
            .write()
            .insert((model.source, model.id.clone()), descriptor);
    }

    pub fn with(self, model: &ModelRef, descriptor: ModelDescriptor) -> Self {
        self.insert(model, descriptor);
        self
    }
}

#[async_trait]
impl ModelCatalog for StaticCatalog {
    async fn resolve(&self, model: &ModelRef) -> Result<ModelDescriptor, CatalogError> {
        self.entries
            .read()
            .get(&(model.source, model.id.clone()))
            .cloned()
            .ok_or_else(|| CatalogError::NotFound(model.to_string()))
    }
}
