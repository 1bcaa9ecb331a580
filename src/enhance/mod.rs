//! Enhancement backends.
//!
//! Each backend wraps one generation model: it builds that model's
//! role-structured prompt, invokes generation under a fixed token budget,
//! strips the model's response framing back off, scores confidence, and
//! reports failures as values instead of raising. Callers never see role
//! markers or framing details; those are owned entirely by the adapters.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::normalize::ImageBuffer;
use crate::prelude::*;
use crate::provider::DownloadError;

pub mod candle_gen;
pub mod generation;
pub mod llama_cpp;
pub mod text;
pub mod vision;

pub use text::TextOnlyBackend;
pub use vision::VisionBackend;

/// The closed set of enhancement backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendId {
    /// Vision-capable model; reads the source image alongside the raw text.
    Phi3Vision,
    /// Text-only model; ignores the image entirely.
    Qwen25,
}

impl BackendId {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendId::Phi3Vision => "phi3",
            BackendId::Qwen25 => "qwen25",
        }
    }
}

impl FromStr for BackendId {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "phi3" => Ok(BackendId::Phi3Vision),
            "qwen25" => Ok(BackendId::Qwen25),
            _ => Err(PipelineError::UnknownBackend { id: s.to_string() }),
        }
    }
}

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for BackendId {
    fn serialize<S: serde::Serializer>(
        &self,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Catalog entry describing one backend to callers.
#[derive(Debug, Clone, Serialize)]
pub struct BackendInfo {
    pub id: BackendId,
    pub display_name: String,
    pub description: String,
    pub capabilities: Vec<String>,
    pub requires_accelerator: bool,
}

/// The backend catalog, in stable order.
pub fn backend_catalog() -> Vec<BackendInfo> {
    vec![
        BackendInfo {
            id: BackendId::Phi3Vision,
            display_name: "Microsoft Phi-3 Vision".to_string(),
            description: "A powerful vision-language model for OCR and text \
                          enhancement"
                .to_string(),
            capabilities: vec![
                "Text extraction from images".to_string(),
                "Text enhancement and correction".to_string(),
                "Multi-language support".to_string(),
                "Layout preservation".to_string(),
            ],
            requires_accelerator: true,
        },
        BackendInfo {
            id: BackendId::Qwen25,
            display_name: "Qwen2.5".to_string(),
            description: "Advanced OCR model with high accuracy and language \
                          understanding"
                .to_string(),
            capabilities: vec![
                "High-accuracy text extraction".to_string(),
                "Multi-language support".to_string(),
                "Context-aware text enhancement".to_string(),
                "Complex layout handling".to_string(),
            ],
            requires_accelerator: true,
        },
    ]
}

/// A failure inside a backend. Captured into [`EnhancementOutcome::error`],
/// never raised across the `enhance` boundary.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The vision-capable backend was invoked without the source image.
    #[error("vision backend requires the source image")]
    MissingImage,

    /// GPU execution was requested but no compatible accelerator is
    /// present. We refuse rather than silently fall back to CPU.
    #[error("GPU requested but no compatible accelerator is available")]
    DeviceUnavailable,

    #[error(transparent)]
    Download(#[from] DownloadError),

    #[error("cannot load model: {0}")]
    ModelLoad(String),

    #[error("generation failed: {0}")]
    Generation(String),
}

/// Backend identity and execution details, reported with every outcome.
#[derive(Debug, Clone, Serialize)]
pub struct BackendMetadata {
    pub name: String,
    pub version: String,
    pub context_window: String,
    pub parameters: String,
    pub device: String,
    pub accelerator_used: bool,
    pub accelerator_name: Option<String>,
}

/// A backend's refined answer. Terminal: returned to the caller, never
/// mutated afterward.
#[derive(Debug)]
pub struct EnhancementOutcome {
    /// The enhanced text. Equals the raw input whenever `error` is set:
    /// enhancement must never destroy previously obtained information.
    pub text: String,
    /// Always within `[0, 1]`; `0.0` on failure. A weak heuristic, not an
    /// accuracy measure.
    pub confidence: f32,
    pub duration: Duration,
    pub metadata: BackendMetadata,
    pub raw_transcript: Option<String>,
    pub error: Option<BackendError>,
}

impl EnhancementOutcome {
    /// The degraded outcome for a captured failure: original text, zero
    /// confidence.
    pub fn failure(
        raw_text: &str,
        metadata: BackendMetadata,
        error: BackendError,
        started: Instant,
    ) -> Self {
        Self {
            text: raw_text.to_string(),
            confidence: 0.0,
            duration: started.elapsed(),
            metadata,
            raw_transcript: None,
            error: Some(error),
        }
    }
}

/// One pipeline run's enhancement request.
#[derive(Debug, Clone, Copy)]
pub struct EnhanceRequest<'a> {
    pub raw_text: &'a str,
    pub image: Option<&'a ImageBuffer>,
    pub languages: Option<&'a [String]>,
    pub use_gpu: bool,
}

/// Interface trait for enhancement backends.
///
/// `enhance` is total: every internal failure is captured into the outcome.
#[async_trait]
pub trait EnhancementBackend: Send + Sync {
    fn id(&self) -> BackendId;

    async fn enhance(&self, req: EnhanceRequest<'_>) -> EnhancementOutcome;
}

/// The optional language hint shared by both prompt builders: requested
/// codes joined with a comma.
pub(crate) fn language_hint(languages: Option<&[String]>) -> Option<String> {
    match languages {
        Some(codes) if !codes.is_empty() => Some(codes.join(", ")),
        _ => None,
    }
}

/// Isolate the text following the final occurrence of `marker`, if any.
///
/// Backends decode their full transcript including echoed prompt framing;
/// the answer is whatever follows the last assistant-turn marker.
pub(crate) fn text_after_last_marker<'a>(
    transcript: &'a str,
    marker: &str,
) -> Option<&'a str> {
    transcript.rsplit_once(marker).map(|(_, rest)| rest)
}
