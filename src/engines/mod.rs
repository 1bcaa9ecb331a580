//! Extraction engine adapters.
//!
//! Each adapter wraps one external recognizer behind the same capability:
//! pixels in, best-effort text out. Engine failure is never an error: a
//! broken engine degrades to an empty result and the pipeline continues on
//! whatever the other engine produced.

use std::fmt;
use std::process::Output;

use async_trait::async_trait;

use crate::normalize::ImageBuffer;
use crate::prelude::*;

pub mod neural;
pub mod tesseract;

pub use neural::NeuralEngine;
pub use tesseract::TesseractEngine;

/// The closed set of extraction engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineId {
    /// General-purpose offline recognizer (tesseract), fed the binarized
    /// mask.
    Tesseract,
    /// Neural region recognizer, fed the grayscale plane.
    Neural,
}

impl fmt::Display for EngineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineId::Tesseract => write!(f, "tesseract"),
            EngineId::Neural => write!(f, "neural"),
        }
    }
}

/// One engine's text hypothesis.
#[derive(Debug, Clone)]
pub struct ExtractionResult {
    pub engine: EngineId,
    pub text: String,
    pub succeeded: bool,
}

impl ExtractionResult {
    pub fn ok(engine: EngineId, text: String) -> Self {
        Self {
            engine,
            text,
            succeeded: true,
        }
    }

    /// The degraded result used whenever an engine fails internally.
    pub fn failed(engine: EngineId) -> Self {
        Self {
            engine,
            text: String::new(),
            succeeded: false,
        }
    }
}

/// Interface trait for extraction engines.
///
/// `extract` is total: implementations must absorb every internal failure
/// and return [`ExtractionResult::failed`] instead of propagating.
#[async_trait]
pub trait OcrEngine: Send + Sync {
    fn id(&self) -> EngineId;

    async fn extract(&self, image: &ImageBuffer) -> ExtractionResult;
}

/// The reconciled single text guess handed to enhancement.
///
/// `text` is never optional; absence of signal is the empty string.
#[derive(Debug, Clone)]
pub struct RawHypothesis {
    pub text: String,
    pub sources: Vec<EngineId>,
}

impl RawHypothesis {
    pub fn empty() -> Self {
        Self {
            text: String::new(),
            sources: Vec::new(),
        }
    }
}

/// Combine two candidate texts into one raw hypothesis.
///
/// Deterministic policy: a single non-empty (whitespace-trimmed) candidate
/// wins outright; two non-empty candidates are decided by character count
/// with ties going to `a`; two empty candidates yield an empty hypothesis,
/// which is not an error. The output is always exactly one of the inputs,
/// never a blend. This is a documented heuristic, not a quality measure.
pub fn reconcile(a: ExtractionResult, b: ExtractionResult) -> RawHypothesis {
    let a_empty = a.text.trim().is_empty();
    let b_empty = b.text.trim().is_empty();
    match (a_empty, b_empty) {
        (true, true) => RawHypothesis::empty(),
        (false, true) => RawHypothesis {
            text: a.text,
            sources: vec![a.engine],
        },
        (true, false) => RawHypothesis {
            text: b.text,
            sources: vec![b.engine],
        },
        (false, false) => {
            let winner = if a.text.chars().count() >= b.text.chars().count() {
                a
            } else {
                b
            };
            RawHypothesis {
                sources: vec![winner.engine],
                text: winner.text,
            }
        }
    }
}

/// Check a finished subprocess for failure, capturing stderr in the error.
///
/// Shared by both engine adapters and the subprocess generation runner.
pub(crate) fn check_command_output(program: &str, output: &Output) -> Result<()> {
    if output.status.success() {
        Ok(())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(anyhow::anyhow!(
            "{program} failed with {}: {}",
            output.status,
            stderr.trim()
        ))
    }
}
