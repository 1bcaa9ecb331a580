//! Pipeline error taxonomy.
//!
//! Only structural and precondition failures abort a pipeline run, and they
//! all live here. Everything that can go wrong *inside* an extraction engine
//! or an enhancement backend is absorbed locally instead: engines degrade to
//! an empty [`ExtractionResult`](crate::engines::ExtractionResult), and
//! backends capture their failures into
//! [`EnhancementOutcome::error`](crate::enhance::EnhancementOutcome).

use thiserror::Error;

/// A fatal pipeline failure. Surfaced to the caller; no partial result.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The input bytes could not be parsed as an image.
    #[error("cannot decode input as an image")]
    Decode {
        #[source]
        source: image::ImageError,
    },

    /// The requested enhancement backend does not exist. Raised before any
    /// extraction work begins.
    #[error("unknown backend {id:?} (expected \"phi3\" or \"qwen25\")")]
    UnknownBackend { id: String },

    /// GPU execution was requested but no compatible accelerator is present.
    /// We refuse rather than silently fall back to a slower path.
    #[error("GPU requested but no compatible accelerator is available")]
    DeviceUnavailable,
}
