//! Vision-capable enhancement backend.
//!
//! Wraps the Phi-3 vision model family through the external multimodal
//! runner. The source image is required: without it this backend refuses
//! (it will not guess), returning the raw text unchanged.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::OnceCell;

use super::generation::{GenerationRequest, Generator};
use super::llama_cpp::LlamaCppVisionGenerator;
use super::{
    BackendError, BackendId, BackendMetadata, EnhanceRequest,
    EnhancementBackend, EnhancementOutcome, language_hint,
    text_after_last_marker,
};
use crate::device::AcceleratorProbe;
use crate::prelude::*;
use crate::provider::ModelProvider;

/// Default GGUF packaging of the model family.
const DEFAULT_MODEL_ID: &str = "xtuner/llava-phi-3-mini-gguf";
const DEFAULT_WEIGHTS_FILE: &str = "llava-phi-3-mini-int4.gguf";
const DEFAULT_MMPROJ_FILE: &str = "llava-phi-3-mini-mmproj-f16.gguf";

/// Generation budget: the sole bound on generation time.
const MAX_NEW_TOKENS: usize = 512;

/// Near-deterministic sampling; correction output should be reproducible.
const TEMPERATURE: f64 = 0.2;

/// The assistant-turn marker in Phi-3 chat framing.
const ASSISTANT_MARKER: &str = "<|assistant|>";
const TURN_END: &str = "<|end|>";

/// Placeholder confidence. The vision model reports no usable signal, so a
/// fixed value is used; it is not an accuracy measure.
const PLACEHOLDER_CONFIDENCE: f32 = 0.85;

/// Configuration for the vision backend's model snapshot and runner.
#[derive(Debug, Clone)]
pub struct VisionModelConfig {
    pub model_id: String,
    pub weights_file: String,
    pub mmproj_file: String,
    /// Runner program name; defaults to `llama-mtmd-cli`.
    pub program: Option<String>,
}

impl Default for VisionModelConfig {
    fn default() -> Self {
        Self {
            model_id: DEFAULT_MODEL_ID.to_string(),
            weights_file: DEFAULT_WEIGHTS_FILE.to_string(),
            mmproj_file: DEFAULT_MMPROJ_FILE.to_string(),
            program: None,
        }
    }
}

/// Vision-capable enhancement backend.
pub struct VisionBackend {
    config: VisionModelConfig,
    provider: Option<Arc<dyn ModelProvider>>,
    probe: Arc<dyn AcceleratorProbe>,
    generator: OnceCell<Arc<dyn Generator>>,
}

impl VisionBackend {
    pub fn new(
        provider: Arc<dyn ModelProvider>,
        probe: Arc<dyn AcceleratorProbe>,
        config: VisionModelConfig,
    ) -> Self {
        Self {
            config,
            provider: Some(provider),
            probe,
            generator: OnceCell::new(),
        }
    }

    /// Build the backend around an already-loaded generator. Used by tests
    /// to exercise the adapter without model weights.
    #[cfg(test)]
    pub fn with_generator(
        probe: Arc<dyn AcceleratorProbe>,
        generator: Arc<dyn Generator>,
    ) -> Self {
        Self {
            config: VisionModelConfig::default(),
            provider: None,
            probe,
            generator: OnceCell::new_with(Some(generator)),
        }
    }

    fn metadata(
        &self,
        accelerator_used: bool,
        accelerator_name: Option<String>,
    ) -> BackendMetadata {
        BackendMetadata {
            name: "Phi-3-Vision-128K-Instruct".to_string(),
            version: "1.0".to_string(),
            context_window: "128K".to_string(),
            parameters: "4.2B".to_string(),
            device: if accelerator_used { "cuda" } else { "cpu" }.to_string(),
            accelerator_used,
            accelerator_name,
        }
    }
}

#[async_trait]
impl EnhancementBackend for VisionBackend {
    fn id(&self) -> BackendId {
        BackendId::Phi3Vision
    }

    #[instrument(level = "debug", skip_all, fields(backend = %self.id()))]
    async fn enhance(&self, req: EnhanceRequest<'_>) -> EnhancementOutcome {
        let started = Instant::now();

        let accelerator = self.probe.detect();
        if req.use_gpu && accelerator.is_none() {
            return EnhancementOutcome::failure(
                req.raw_text,
                self.metadata(false, None),
                BackendError::DeviceUnavailable,
                started,
            );
        }
        let accelerator_used = req.use_gpu;
        let accelerator_name = if accelerator_used {
            accelerator.map(|a| a.name)
        } else {
            None
        };
        let metadata = self.metadata(accelerator_used, accelerator_name);

        // This variant refuses to guess without the source image.
        let Some(image) = req.image else {
            return EnhancementOutcome::failure(
                req.raw_text,
                metadata,
                BackendError::MissingImage,
                started,
            );
        };

        let generator = match self
            .generator
            .get_or_try_init(|| async {
                let provider = self.provider.as_deref().ok_or_else(|| {
                    BackendError::ModelLoad(
                        "no model provider configured".to_string(),
                    )
                })?;
                LlamaCppVisionGenerator::load(
                    provider,
                    &self.config.model_id,
                    &self.config.weights_file,
                    &self.config.mmproj_file,
                    self.config.program.clone(),
                    accelerator_used,
                )
                .await
            })
            .await
        {
            Ok(generator) => Arc::clone(generator),
            Err(error) => {
                return EnhancementOutcome::failure(
                    req.raw_text,
                    metadata,
                    error,
                    started,
                );
            }
        };

        let prompt = build_prompt(req.raw_text, req.languages);
        let transcript = match generator
            .generate(GenerationRequest {
                prompt: &prompt,
                image: Some(image),
                max_new_tokens: MAX_NEW_TOKENS,
                temperature: Some(TEMPERATURE),
            })
            .await
        {
            Ok(transcript) => transcript,
            Err(error) => {
                return EnhancementOutcome::failure(
                    req.raw_text,
                    metadata,
                    error,
                    started,
                );
            }
        };

        let enhanced = parse_transcript(&transcript);
        EnhancementOutcome {
            text: enhanced,
            confidence: PLACEHOLDER_CONFIDENCE,
            duration: started.elapsed(),
            metadata,
            raw_transcript: Some(transcript),
            error: None,
        }
    }
}

/// Phi-3 chat prompt: fixed extraction instruction, optional language hint,
/// the image slot and the raw hypothesis.
fn build_prompt(raw_text: &str, languages: Option<&[String]>) -> String {
    let language_str = language_hint(languages)
        .map(|hint| format!(" The text is in {hint}."))
        .unwrap_or_default();
    format!(
        "<|system|>\n\
         You are an expert OCR assistant. Your task is to accurately extract \
         text from the image.\n\
         Ensure the text is coherent, maintains the original formatting, and \
         is free of errors.{language_str}\n\
         <|user|>\n\
         <|image_1|>\n\
         Here is the raw OCR text recovered from this image:\n\
         \n\
         {raw_text}\n\
         \n\
         Extract and enhance the text from the image, using the raw text as \
         a hint. If multiple languages are present, identify them.\n\
         <|end|>\n\
         <|assistant|>\n"
    )
}

/// Isolate the answer: everything after the last assistant marker, up to
/// the end-of-turn marker. A transcript without the marker is used whole.
fn parse_transcript(transcript: &str) -> String {
    match text_after_last_marker(transcript, ASSISTANT_MARKER) {
        Some(rest) => match rest.split_once(TURN_END) {
            Some((answer, _)) => answer.trim().to_string(),
            None => rest.trim().to_string(),
        },
        None => transcript.trim().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::device::testing::FixedProbe;
    use crate::normalize::{ImageBuffer, normalize};

    struct FixedGenerator {
        transcript: String,
        calls: AtomicUsize,
    }

    impl FixedGenerator {
        fn new(transcript: &str) -> Arc<Self> {
            Arc::new(Self {
                transcript: transcript.to_string(),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Generator for FixedGenerator {
        async fn generate(
            &self,
            req: GenerationRequest<'_>,
        ) -> Result<String, BackendError> {
            assert!(req.image.is_some(), "vision generation needs the image");
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.transcript.clone())
        }
    }

    fn test_image() -> ImageBuffer {
        let img = image::GrayImage::from_fn(8, 8, |x, _| {
            image::Luma([if x < 4 { 10 } else { 240 }])
        });
        let mut buf = Vec::new();
        img.write_to(
            &mut std::io::Cursor::new(&mut buf),
            image::ImageFormat::Png,
        )
        .unwrap();
        normalize(&buf).unwrap()
    }

    #[tokio::test]
    async fn missing_image_is_captured_not_raised() {
        let generator = FixedGenerator::new("unused");
        let backend = VisionBackend::with_generator(
            Arc::new(FixedProbe::absent()),
            generator.clone(),
        );
        let outcome = backend
            .enhance(EnhanceRequest {
                raw_text: "raw scan text",
                image: None,
                languages: None,
                use_gpu: false,
            })
            .await;
        assert!(matches!(outcome.error, Some(BackendError::MissingImage)));
        assert_eq!(outcome.text, "raw scan text");
        assert_eq!(outcome.confidence, 0.0);
        assert_eq!(generator.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn enhance_parses_the_assistant_turn() {
        let generator = FixedGenerator::new(
            "<|system|>\ninstr\n<|user|>\nstuff\n<|end|>\n\
             <|assistant|>\nINVOICE 2024\n<|end|>",
        );
        let backend = VisionBackend::with_generator(
            Arc::new(FixedProbe::absent()),
            generator,
        );
        let image = test_image();
        let outcome = backend
            .enhance(EnhanceRequest {
                raw_text: "INV0ICE",
                image: Some(&image),
                languages: None,
                use_gpu: false,
            })
            .await;
        assert!(outcome.error.is_none());
        assert_eq!(outcome.text, "INVOICE 2024");
        assert_eq!(outcome.confidence, PLACEHOLDER_CONFIDENCE);
        assert!(outcome.raw_transcript.is_some());
    }

    #[tokio::test]
    async fn transcript_without_marker_is_used_whole() {
        let generator = FixedGenerator::new("  bare completion text \n");
        let backend = VisionBackend::with_generator(
            Arc::new(FixedProbe::absent()),
            generator,
        );
        let image = test_image();
        let outcome = backend
            .enhance(EnhanceRequest {
                raw_text: "raw",
                image: Some(&image),
                languages: None,
                use_gpu: false,
            })
            .await;
        assert_eq!(outcome.text, "bare completion text");
    }

    #[tokio::test]
    async fn gpu_request_without_accelerator_is_refused() {
        let generator = FixedGenerator::new("unused");
        let backend = VisionBackend::with_generator(
            Arc::new(FixedProbe::absent()),
            generator.clone(),
        );
        let image = test_image();
        let outcome = backend
            .enhance(EnhanceRequest {
                raw_text: "raw",
                image: Some(&image),
                languages: None,
                use_gpu: true,
            })
            .await;
        assert!(matches!(
            outcome.error,
            Some(BackendError::DeviceUnavailable)
        ));
        assert_eq!(outcome.text, "raw");
        assert_eq!(generator.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn prompt_embeds_image_slot_and_hypothesis() {
        let languages = vec!["fr".to_string()];
        let prompt = build_prompt("texte brut", Some(&languages));
        assert!(prompt.contains("<|image_1|>"));
        assert!(prompt.contains("texte brut"));
        assert!(prompt.contains("The text is in fr."));
        assert!(prompt.ends_with("<|assistant|>\n"));
    }
}
