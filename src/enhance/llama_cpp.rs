//! Out-of-process multimodal generation.
//!
//! candle has no port of the vision model family, so the vision backend
//! generates through a local llama.cpp multimodal runner instead: GGUF
//! weights plus the vision projector are materialized by the
//! [`ModelProvider`], the source image and framed prompt are handed to the
//! runner CLI, and its stdout is the transcript. Runs are serialized per
//! instance, so there is one resident model process at a time.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::Mutex;

use super::BackendError;
use super::generation::{GenerationRequest, Generator};
use crate::engines::check_command_output;
use crate::prelude::*;
use crate::provider::ModelProvider;

/// A multimodal GGUF model driven through a llama.cpp CLI runner.
pub struct LlamaCppVisionGenerator {
    program: String,
    weights_path: PathBuf,
    mmproj_path: PathBuf,
    gpu_layers: Option<u32>,
    run_lock: Mutex<()>,
}

impl LlamaCppVisionGenerator {
    /// Materialize the weights and projector for `model_id` and wrap them.
    pub async fn load(
        provider: &dyn ModelProvider,
        model_id: &str,
        weights_file: &str,
        mmproj_file: &str,
        program: Option<String>,
        use_gpu: bool,
    ) -> Result<Arc<dyn Generator>, BackendError> {
        let snapshot = provider
            .ensure_local(model_id, &[weights_file, mmproj_file])
            .await?;
        info!(model_id, "vision model snapshot ready");
        Ok(Arc::new(Self {
            program: program.unwrap_or_else(|| "llama-mtmd-cli".to_string()),
            weights_path: snapshot.join(weights_file),
            mmproj_path: snapshot.join(mmproj_file),
            gpu_layers: use_gpu.then_some(999),
            run_lock: Mutex::new(()),
        }))
    }
}

#[async_trait]
impl Generator for LlamaCppVisionGenerator {
    #[instrument(level = "debug", skip_all, fields(max_new_tokens = req.max_new_tokens))]
    async fn generate(
        &self,
        req: GenerationRequest<'_>,
    ) -> Result<String, BackendError> {
        let image = req.image.ok_or_else(|| {
            BackendError::Generation(
                "vision runner invoked without an image".to_string(),
            )
        })?;

        let _running = self.run_lock.lock().await;

        let tmpdir = tempfile::TempDir::with_prefix("textlift-vision")
            .map_err(|err| BackendError::Generation(err.to_string()))?;
        let image_path = tmpdir.path().join("input.png");
        let png = image
            .rgb_png()
            .map_err(|err| BackendError::Generation(err.to_string()))?;
        tokio::fs::write(&image_path, &png)
            .await
            .map_err(|err| BackendError::Generation(err.to_string()))?;

        let mut command = Command::new(&self.program);
        command
            .arg("-m")
            .arg(&self.weights_path)
            .arg("--mmproj")
            .arg(&self.mmproj_path)
            .arg("--image")
            .arg(&image_path)
            .arg("-p")
            .arg(req.prompt)
            .args(["-n", &req.max_new_tokens.to_string()])
            .args(["--temp", &req.temperature.unwrap_or(0.0).to_string()]);
        if let Some(layers) = self.gpu_layers {
            command.args(["-ngl", &layers.to_string()]);
        }

        let output = command
            .output()
            .await
            .map_err(|err| BackendError::Generation(err.to_string()))?;
        check_command_output(&self.program, &output)
            .map_err(|err| BackendError::Generation(format!("{err:#}")))?;

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}
