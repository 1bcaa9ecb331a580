//! Tesseract engine adapter.
//!
//! Wraps the `tesseract` CLI tool. The binarized mask is written to a
//! temporary file and the tool's text output is read back. Any failure
//! (missing binary, bad exit status, unreadable output) degrades to an
//! empty extraction result.

use async_trait::async_trait;
use tokio::process::Command;

use super::{EngineId, ExtractionResult, OcrEngine, check_command_output};
use crate::normalize::ImageBuffer;
use crate::prelude::*;

/// Engine adapter wrapping the `tesseract` CLI tool.
pub struct TesseractEngine {
    program: String,
    languages: Vec<String>,
}

impl TesseractEngine {
    pub fn new(program: Option<String>, languages: Vec<String>) -> Self {
        Self {
            program: program.unwrap_or_else(|| "tesseract".to_string()),
            languages: if languages.is_empty() {
                vec!["en".to_string()]
            } else {
                languages
            },
        }
    }

    /// Tesseract wants ISO 639-2 codes joined with `+`.
    fn lang_arg(&self) -> String {
        self.languages
            .iter()
            .map(|code| tesseract_code(code))
            .collect::<Vec<_>>()
            .join("+")
    }

    async fn run(&self, image: &ImageBuffer) -> Result<String> {
        let tmpdir = tempfile::TempDir::with_prefix("textlift-tesseract")?;
        let input_path = tmpdir.path().join("input.png");
        let output_base = tmpdir.path().join("output");

        let png = image.binary_png().context("cannot encode binarized mask")?;
        tokio::fs::write(&input_path, &png)
            .await
            .context("cannot write tesseract input file")?;

        let output = Command::new(&self.program)
            .arg(&input_path)
            .arg(&output_base)
            .args(["-l", &self.lang_arg()])
            .output()
            .await
            .context("cannot run tesseract")?;
        check_command_output(&self.program, &output)?;

        tokio::fs::read_to_string(output_base.with_extension("txt"))
            .await
            .context("cannot read tesseract output file")
    }
}

#[async_trait]
impl OcrEngine for TesseractEngine {
    fn id(&self) -> EngineId {
        EngineId::Tesseract
    }

    #[instrument(level = "debug", skip_all, fields(engine = %self.id()))]
    async fn extract(&self, image: &ImageBuffer) -> ExtractionResult {
        match self.run(image).await {
            Ok(text) => ExtractionResult::ok(self.id(), text),
            Err(err) => {
                warn!(error = %format!("{err:#}"), "tesseract extraction failed");
                ExtractionResult::failed(self.id())
            }
        }
    }
}

/// Map a two-letter language code onto tesseract's traineddata naming.
/// Unrecognized codes pass through unchanged so callers can use tesseract's
/// own names directly.
fn tesseract_code(code: &str) -> String {
    match code {
        "en" => "eng".to_string(),
        "fr" => "fra".to_string(),
        "de" => "deu".to_string(),
        "es" => "spa".to_string(),
        "it" => "ita".to_string(),
        "pt" => "por".to_string(),
        other => other.to_string(),
    }
}
