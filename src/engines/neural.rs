//! Neural engine adapter.
//!
//! Wraps the `easyocr` CLI recognizer. It detects text regions and returns
//! one line of text per region in its own detection order, which is not
//! spatial reading order, so callers must not assume layout fidelity. The
//! per-region lines are joined with single spaces, and any internal failure
//! degrades to an empty extraction result.

use async_trait::async_trait;
use tokio::process::Command;

use super::{EngineId, ExtractionResult, OcrEngine, check_command_output};
use crate::normalize::ImageBuffer;
use crate::prelude::*;

/// Engine adapter wrapping the `easyocr` CLI recognizer.
pub struct NeuralEngine {
    program: String,
    languages: Vec<String>,
}

impl NeuralEngine {
    pub fn new(program: Option<String>, languages: Vec<String>) -> Self {
        Self {
            program: program.unwrap_or_else(|| "easyocr".to_string()),
            languages: if languages.is_empty() {
                vec!["en".to_string()]
            } else {
                languages
            },
        }
    }

    async fn run(&self, image: &ImageBuffer) -> Result<String> {
        let tmpdir = tempfile::TempDir::with_prefix("textlift-neural")?;
        let input_path = tmpdir.path().join("input.png");

        // The recognizer runs on the grayscale plane, not the hard mask:
        // its detector degrades badly on binarized input.
        let png = image.gray_png().context("cannot encode grayscale plane")?;
        tokio::fs::write(&input_path, &png)
            .await
            .context("cannot write recognizer input file")?;

        let mut command = Command::new(&self.program);
        command.arg("-l");
        for language in &self.languages {
            command.arg(language);
        }
        let output = command
            .arg("-f")
            .arg(&input_path)
            .args(["--detail", "0", "--gpu", "False"])
            .output()
            .await
            .context("cannot run neural recognizer")?;
        check_command_output(&self.program, &output)?;

        Ok(join_region_lines(&String::from_utf8_lossy(&output.stdout)))
    }
}

#[async_trait]
impl OcrEngine for NeuralEngine {
    fn id(&self) -> EngineId {
        EngineId::Neural
    }

    #[instrument(level = "debug", skip_all, fields(engine = %self.id()))]
    async fn extract(&self, image: &ImageBuffer) -> ExtractionResult {
        match self.run(image).await {
            Ok(text) => ExtractionResult::ok(self.id(), text),
            Err(err) => {
                warn!(error = %format!("{err:#}"), "neural extraction failed");
                ExtractionResult::failed(self.id())
            }
        }
    }
}

/// Concatenate per-region output lines with single spaces.
fn join_region_lines(stdout: &str) -> String {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_lines_are_joined_with_spaces() {
        let stdout = "INVOICE\n  2024  \n\nTotal due\n";
        assert_eq!(join_region_lines(stdout), "INVOICE 2024 Total due");
    }

    #[test]
    fn no_regions_yields_empty_text() {
        assert_eq!(join_region_lines("\n  \n"), "");
    }

    #[tokio::test]
    async fn missing_binary_degrades_to_empty_result() {
        let engine =
            NeuralEngine::new(Some("textlift-no-such-easyocr".to_string()), vec![]);
        let image = {
            let img = image::GrayImage::from_pixel(4, 4, image::Luma([0]));
            let mut buf = Vec::new();
            img.write_to(
                &mut std::io::Cursor::new(&mut buf),
                image::ImageFormat::Png,
            )
            .unwrap();
            crate::normalize::normalize(&buf).unwrap()
        };
        let result = engine.extract(&image).await;
        assert!(!result.succeeded);
        assert_eq!(result.text, "");
    }
}
