//! Model weight acquisition.
//!
//! Enhancement backends never talk to the model registry directly; they go
//! through the [`ModelProvider`] capability, which materializes named files
//! from a model repository into a local directory. The default
//! implementation is backed by the Hugging Face hub cache, so repeated
//! calls are cheap and offline runs work once the weights are present.

use async_trait::async_trait;
use hf_hub::api::tokio::{Api, ApiBuilder};
use thiserror::Error;

use crate::prelude::{Path, PathBuf};

/// A model could not be materialized locally.
#[derive(Debug, Error)]
#[error("cannot materialize model {model_id:?} locally")]
pub struct DownloadError {
    pub model_id: String,
    #[source]
    pub source: Box<dyn std::error::Error + Send + Sync>,
}

impl DownloadError {
    pub fn new(
        model_id: &str,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            model_id: model_id.to_string(),
            source: Box::new(source),
        }
    }
}

/// Capability for materializing model weights locally.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Ensure every named file of `model_id` exists locally and return the
    /// directory containing them. Idempotent: calling again once the files
    /// are materialized is a cheap cache hit.
    async fn ensure_local(
        &self,
        model_id: &str,
        files: &[&str],
    ) -> Result<PathBuf, DownloadError>;
}

/// [`ModelProvider`] backed by the Hugging Face hub.
pub struct HfHubProvider {
    api: Api,
}

impl HfHubProvider {
    pub fn new() -> anyhow::Result<Self> {
        let api = ApiBuilder::new().with_progress(false).build()?;
        Ok(Self { api })
    }
}

#[async_trait]
impl ModelProvider for HfHubProvider {
    async fn ensure_local(
        &self,
        model_id: &str,
        files: &[&str],
    ) -> Result<PathBuf, DownloadError> {
        let repo = self.api.model(model_id.to_string());
        let mut snapshot_dir: Option<PathBuf> = None;
        for file in files {
            let path = repo
                .get(file)
                .await
                .map_err(|err| DownloadError::new(model_id, err))?;
            snapshot_dir = path.parent().map(Path::to_path_buf);
        }
        snapshot_dir.ok_or_else(|| DownloadError {
            model_id: model_id.to_string(),
            source: "no files requested".into(),
        })
    }
}
