//! Pipeline coordinator.
//!
//! The public entry point: normalize the image, run both extraction
//! engines, reconcile their hypotheses, then hand the winner (and the
//! image) to the chosen enhancement backend. Extraction is
//! backend-independent and always runs first; only the degenerate
//! all-or-nothing GPU precondition aborts between extraction and
//! enhancement.

use std::sync::Arc;

use serde::Serialize;

use crate::device::{AcceleratorProbe, CudaProbe};
use crate::engines::{NeuralEngine, OcrEngine, TesseractEngine, reconcile};
use crate::enhance::vision::VisionModelConfig;
use crate::enhance::{
    BackendId, BackendMetadata, EnhanceRequest, EnhancementBackend,
    TextOnlyBackend, VisionBackend,
};
use crate::normalize::normalize;
use crate::prelude::*;
use crate::provider::{HfHubProvider, ModelProvider};

/// Wiring configuration for a real pipeline.
#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
    /// Override the tesseract program name.
    pub tesseract_program: Option<String>,
    /// Override the neural recognizer program name.
    pub neural_program: Option<String>,
    /// Languages the extraction engines are configured for.
    pub engine_languages: Vec<String>,
    /// Override the text model snapshot id.
    pub text_model_id: Option<String>,
    /// Vision model snapshot and runner configuration.
    pub vision_model: VisionModelConfig,
}

/// One pipeline run's parameters.
#[derive(Debug, Clone)]
pub struct PipelineRequest {
    /// Backend id; must name a known variant.
    pub backend: String,
    pub languages: Option<Vec<String>>,
    /// Require GPU execution. Refused outright when no accelerator exists.
    pub use_gpu: bool,
}

/// The caller-facing unified answer.
#[derive(Debug, Serialize)]
pub struct PipelineResult {
    pub raw_text: String,
    pub enhanced_text: String,
    pub model_used: BackendId,
    pub confidence: f32,
    /// Wall-clock seconds for the whole run.
    pub processing_time: f64,
    pub languages: Vec<String>,
    pub model_details: BackendMetadata,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_response: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The assembled pipeline.
pub struct Pipeline {
    engine_a: Arc<dyn OcrEngine>,
    engine_b: Arc<dyn OcrEngine>,
    vision: Arc<dyn EnhancementBackend>,
    text: Arc<dyn EnhancementBackend>,
    probe: Arc<dyn AcceleratorProbe>,
}

impl Pipeline {
    /// Wire up the real engines and backends.
    pub fn new(config: PipelineConfig) -> anyhow::Result<Self> {
        let provider: Arc<dyn ModelProvider> = Arc::new(HfHubProvider::new()?);
        let probe: Arc<dyn AcceleratorProbe> = Arc::new(CudaProbe::new());
        Ok(Self {
            engine_a: Arc::new(TesseractEngine::new(
                config.tesseract_program,
                config.engine_languages.clone(),
            )),
            engine_b: Arc::new(NeuralEngine::new(
                config.neural_program,
                config.engine_languages,
            )),
            vision: Arc::new(VisionBackend::new(
                Arc::clone(&provider),
                Arc::clone(&probe),
                config.vision_model,
            )),
            text: Arc::new(TextOnlyBackend::new(
                provider,
                Arc::clone(&probe),
                config.text_model_id,
            )),
            probe,
        })
    }

    /// Assemble a pipeline from externally built parts.
    #[cfg(test)]
    pub(crate) fn from_parts(
        engine_a: Arc<dyn OcrEngine>,
        engine_b: Arc<dyn OcrEngine>,
        vision: Arc<dyn EnhancementBackend>,
        text: Arc<dyn EnhancementBackend>,
        probe: Arc<dyn AcceleratorProbe>,
    ) -> Self {
        Self {
            engine_a,
            engine_b,
            vision,
            text,
            probe,
        }
    }

    fn backend_for(&self, id: BackendId) -> &dyn EnhancementBackend {
        match id {
            BackendId::Phi3Vision => self.vision.as_ref(),
            BackendId::Qwen25 => self.text.as_ref(),
        }
    }

    /// Run the full pipeline on one image.
    #[instrument(level = "debug", skip_all, fields(backend = %req.backend, use_gpu = req.use_gpu))]
    pub async fn run(
        &self,
        raw_bytes: &[u8],
        req: &PipelineRequest,
    ) -> Result<PipelineResult, PipelineError> {
        let started = Instant::now();

        // Validate the backend choice before any work happens.
        let backend_id: BackendId = req.backend.parse()?;

        let image = normalize(raw_bytes)?;
        debug!(
            width = image.width(),
            height = image.height(),
            "image normalized"
        );

        // The engines share no mutable state; run them concurrently and
        // join. Either one failing is fine; failure is an empty result.
        let (a, b) = tokio::join!(
            self.engine_a.extract(&image),
            self.engine_b.extract(&image)
        );
        debug!(a_ok = a.succeeded, b_ok = b.succeeded, "extraction complete");
        let hypothesis = reconcile(a, b);
        info!(
            sources = ?hypothesis.sources,
            chars = hypothesis.text.chars().count(),
            "reconciled raw hypothesis"
        );

        // All-or-nothing device precondition, checked before any model work.
        if req.use_gpu && self.probe.detect().is_none() {
            return Err(PipelineError::DeviceUnavailable);
        }

        let outcome = self
            .backend_for(backend_id)
            .enhance(EnhanceRequest {
                raw_text: &hypothesis.text,
                image: Some(&image),
                languages: req.languages.as_deref(),
                use_gpu: req.use_gpu,
            })
            .await;
        if let Some(error) = &outcome.error {
            warn!(%error, backend = %backend_id, "enhancement degraded to passthrough");
        }
        debug!(
            enhance_ms = outcome.duration.as_millis() as u64,
            confidence = outcome.confidence,
            "enhancement complete"
        );

        Ok(PipelineResult {
            raw_text: hypothesis.text,
            enhanced_text: outcome.text,
            model_used: backend_id,
            confidence: outcome.confidence,
            processing_time: started.elapsed().as_secs_f64(),
            languages: req
                .languages
                .clone()
                .unwrap_or_else(|| vec!["en".to_string()]),
            model_details: outcome.metadata,
            raw_response: outcome.raw_transcript,
            error: outcome.error.map(|error| error.to_string()),
        })
    }
}
