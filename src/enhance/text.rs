//! Text-only enhancement backend.
//!
//! Wraps a ChatML-framed chat model running in-process on candle. The image
//! is ignored entirely even when supplied; only the raw hypothesis text is
//! corrected.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::OnceCell;

use super::candle_gen::CandleTextGenerator;
use super::generation::{GenerationRequest, Generator};
use super::{
    BackendError, BackendId, BackendMetadata, EnhanceRequest,
    EnhancementBackend, EnhancementOutcome, language_hint,
    text_after_last_marker,
};
use crate::device::AcceleratorProbe;
use crate::prelude::*;
use crate::provider::ModelProvider;

/// Default chat model snapshot.
const DEFAULT_MODEL_ID: &str = "Qwen/Qwen2.5-7B-Instruct";

/// Generation budget: the sole bound on generation time.
const MAX_NEW_TOKENS: usize = 1024;

/// The assistant-turn marker in ChatML framing.
const ASSISTANT_MARKER: &str = "<|im_start|>assistant";
const TURN_END: &str = "<|im_end|>";

/// Text-only enhancement backend.
pub struct TextOnlyBackend {
    model_id: String,
    provider: Option<Arc<dyn ModelProvider>>,
    probe: Arc<dyn AcceleratorProbe>,
    generator: OnceCell<Arc<dyn Generator>>,
}

impl TextOnlyBackend {
    pub fn new(
        provider: Arc<dyn ModelProvider>,
        probe: Arc<dyn AcceleratorProbe>,
        model_id: Option<String>,
    ) -> Self {
        Self {
            model_id: model_id.unwrap_or_else(|| DEFAULT_MODEL_ID.to_string()),
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
            model_id: DEFAULT_MODEL_ID.to_string(),
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
            name: "Qwen2.5-7B-Instruct".to_string(),
            version: "2.5".to_string(),
            context_window: "32K".to_string(),
            parameters: "7B".to_string(),
            device: if accelerator_used { "cuda" } else { "cpu" }.to_string(),
            accelerator_used,
            accelerator_name,
        }
    }
}

#[async_trait]
impl EnhancementBackend for TextOnlyBackend {
    fn id(&self) -> BackendId {
        BackendId::Qwen25
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

        // Empty hypothesis: pass it through rather than hallucinate content
        // out of nothing. The confidence floor applies.
        if req.raw_text.trim().is_empty() {
            return EnhancementOutcome {
                text: req.raw_text.to_string(),
                confidence: 0.5,
                duration: started.elapsed(),
                metadata,
                raw_transcript: None,
                error: None,
            };
        }

        let generator = match self
            .generator
            .get_or_try_init(|| async {
                let provider = self.provider.as_deref().ok_or_else(|| {
                    BackendError::ModelLoad(
                        "no model provider configured".to_string(),
                    )
                })?;
                CandleTextGenerator::load(
                    provider,
                    &self.model_id,
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
                image: None,
                max_new_tokens: MAX_NEW_TOKENS,
                temperature: None,
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
        let confidence = word_overlap_confidence(req.raw_text, &enhanced);
        EnhancementOutcome {
            text: enhanced,
            confidence,
            duration: started.elapsed(),
            metadata,
            raw_transcript: None,
            error: None,
        }
    }
}

/// ChatML prompt with the fixed correction instruction, the optional
/// language hint and the raw hypothesis.
fn build_prompt(raw_text: &str, languages: Option<&[String]>) -> String {
    let language_str = language_hint(languages)
        .map(|hint| format!(" The text is in {hint}."))
        .unwrap_or_default();
    format!(
        "<|im_start|>system\n\
         You are an expert OCR post-processing assistant. Your task is to \
         correct and enhance raw OCR text.\n\
         Fix any errors, maintain the original formatting, and ensure the \
         text is coherent and accurate.{language_str}\n\
         <|im_end|>\n\
         <|im_start|>user\n\
         Here is the raw OCR text that needs correction and enhancement:\n\
         \n\
         {raw_text}\n\
         <|im_end|>\n\
         <|im_start|>assistant\n"
    )
}

/// Isolate the answer from the echoed transcript: everything after the last
/// assistant-turn marker, up to the turn terminator. A transcript without
/// the marker is used whole.
fn parse_transcript(transcript: &str) -> String {
    match text_after_last_marker(transcript, ASSISTANT_MARKER) {
        Some(rest) => match rest.split_once(TURN_END) {
            Some((answer, _)) => answer.trim().to_string(),
            None => rest.trim().to_string(),
        },
        None => transcript.trim().to_string(),
    }
}

/// Fraction of the original input words retained in the output, clamped to
/// `[0.5, 0.95]`. A weak proxy for quality, preserved for compatibility.
fn word_overlap_confidence(original: &str, enhanced: &str) -> f32 {
    let original_words: HashSet<String> = original
        .to_lowercase()
        .split_whitespace()
        .map(str::to_string)
        .collect();
    let enhanced_words: HashSet<String> = enhanced
        .to_lowercase()
        .split_whitespace()
        .map(str::to_string)
        .collect();
    let retained = original_words.intersection(&enhanced_words).count();
    let ratio = retained as f32 / original_words.len().max(1) as f32;
    ratio.clamp(0.5, 0.95)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::device::testing::FixedProbe;

    /// Generator returning a fixed transcript, counting invocations.
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
            _req: GenerationRequest<'_>,
        ) -> Result<String, BackendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.transcript.clone())
        }
    }

    struct FailingGenerator;

    #[async_trait]
    impl Generator for FailingGenerator {
        async fn generate(
            &self,
            _req: GenerationRequest<'_>,
        ) -> Result<String, BackendError> {
            Err(BackendError::Generation("model exploded".to_string()))
        }
    }

    fn request(raw_text: &str) -> EnhanceRequest<'_> {
        EnhanceRequest {
            raw_text,
            image: None,
            languages: None,
            use_gpu: false,
        }
    }

    #[test]
    fn prompt_embeds_text_and_language_hint() {
        let languages = vec!["en".to_string(), "de".to_string()];
        let prompt = build_prompt("INVO1CE", Some(&languages));
        assert!(prompt.contains("INVO1CE"));
        assert!(prompt.contains("The text is in en, de."));
        assert!(prompt.ends_with("<|im_start|>assistant\n"));

        let bare = build_prompt("INVO1CE", None);
        assert!(!bare.contains("The text is in"));
    }

    #[test]
    fn transcript_parsing_isolates_the_final_turn() {
        let transcript = "<|im_start|>system\nstuff<|im_end|>\n\
                          <|im_start|>user\nraw<|im_end|>\n\
                          <|im_start|>assistant\nINVOICE 2024<|im_end|>";
        assert_eq!(parse_transcript(transcript), "INVOICE 2024");

        // No turn terminator: use everything after the marker.
        let open = "<|im_start|>assistant\n  fixed text  ";
        assert_eq!(parse_transcript(open), "fixed text");

        // No marker at all: fall back to the whole trimmed output.
        assert_eq!(parse_transcript("  plain output \n"), "plain output");
    }

    #[test]
    fn confidence_is_clamped_word_overlap() {
        // Fully retained input clamps to the 0.95 ceiling.
        assert_eq!(
            word_overlap_confidence("invoice 2024", "Invoice 2024"),
            0.95
        );
        // Nothing retained clamps to the 0.5 floor.
        assert_eq!(word_overlap_confidence("alpha beta", "gamma delta"), 0.5);
        // Half retained sits in between.
        let half = word_overlap_confidence("alpha beta", "alpha gamma");
        assert!((half - 0.5).abs() < f32::EPSILON);
        let three_quarters =
            word_overlap_confidence("a b c d", "a b c x y z");
        assert!((three_quarters - 0.75).abs() < 1e-6);
    }

    #[tokio::test]
    async fn enhance_extracts_the_assistant_turn() {
        let generator = FixedGenerator::new(
            "<|im_start|>assistant\nINVOICE 2024<|im_end|>",
        );
        let backend = TextOnlyBackend::with_generator(
            Arc::new(FixedProbe::absent()),
            generator.clone(),
        );
        let outcome = backend.enhance(request("INV0ICE 2O24")).await;
        assert!(outcome.error.is_none());
        assert_eq!(outcome.text, "INVOICE 2024");
        assert!((0.0..=1.0).contains(&outcome.confidence));
        assert_eq!(generator.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn generation_failure_returns_input_unchanged() {
        let backend = TextOnlyBackend::with_generator(
            Arc::new(FixedProbe::absent()),
            Arc::new(FailingGenerator),
        );
        let outcome = backend.enhance(request("scanned text")).await;
        assert_eq!(outcome.text, "scanned text");
        assert_eq!(outcome.confidence, 0.0);
        assert!(matches!(
            outcome.error,
            Some(BackendError::Generation(_))
        ));
    }

    #[tokio::test]
    async fn empty_input_passes_through_without_generating() {
        let generator = FixedGenerator::new("should never be used");
        let backend = TextOnlyBackend::with_generator(
            Arc::new(FixedProbe::absent()),
            generator.clone(),
        );
        let outcome = backend.enhance(request("   \n")).await;
        assert!(outcome.error.is_none());
        assert_eq!(outcome.text, "   \n");
        assert_eq!(generator.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn gpu_request_without_accelerator_is_refused() {
        let generator = FixedGenerator::new("unused");
        let backend = TextOnlyBackend::with_generator(
            Arc::new(FixedProbe::absent()),
            generator.clone(),
        );
        let outcome = backend
            .enhance(EnhanceRequest {
                raw_text: "text",
                image: None,
                languages: None,
                use_gpu: true,
            })
            .await;
        assert!(matches!(
            outcome.error,
            Some(BackendError::DeviceUnavailable)
        ));
        assert_eq!(outcome.text, "text");
        assert_eq!(outcome.confidence, 0.0);
        assert_eq!(generator.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn accelerator_is_reported_when_used() {
        let generator =
            FixedGenerator::new("<|im_start|>assistant\nok<|im_end|>");
        let backend = TextOnlyBackend::with_generator(
            Arc::new(FixedProbe::present("Fake RTX")),
            generator,
        );
        let outcome = backend
            .enhance(EnhanceRequest {
                raw_text: "ok",
                image: None,
                languages: None,
                use_gpu: true,
            })
            .await;
        assert!(outcome.error.is_none());
        assert!(outcome.metadata.accelerator_used);
        assert_eq!(outcome.metadata.device, "cuda");
        assert_eq!(
            outcome.metadata.accelerator_name.as_deref(),
            Some("Fake RTX")
        );
    }
}
