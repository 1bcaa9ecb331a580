//! The generation seam.
//!
//! Backend adapters own prompt framing, response parsing and confidence
//! scoring; the actual token generation happens behind this trait so the
//! adapters can be exercised against stub generators in tests, and so each
//! backend can pick the execution strategy its model needs (in-process
//! candle for the text model, an external multimodal runner for the vision
//! model).

use async_trait::async_trait;

use super::BackendError;
use crate::normalize::ImageBuffer;

/// One generation invocation.
pub struct GenerationRequest<'a> {
    /// The fully framed prompt, role markers included.
    pub prompt: &'a str,
    /// Source image for vision-capable models.
    pub image: Option<&'a ImageBuffer>,
    /// Hard cap on new tokens; the only bound on generation time.
    pub max_new_tokens: usize,
    /// Sampling temperature. `None` means greedy decoding.
    pub temperature: Option<f64>,
}

/// A loaded generation model.
///
/// `generate` returns the full transcript: the echoed prompt framing
/// followed by the completion, which is what the adapters' marker parsing
/// expects. Implementations serialize access to any non-reentrant model
/// state internally.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(
        &self,
        req: GenerationRequest<'_>,
    ) -> Result<String, BackendError>;
}
