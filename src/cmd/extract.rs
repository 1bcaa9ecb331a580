//! The `extract` subcommand.

use clap::Args;

use super::write_json;
use crate::enhance::vision::VisionModelConfig;
use crate::pipeline::{Pipeline, PipelineConfig, PipelineRequest};
use crate::prelude::*;

/// The `extract` subcommand's options.
#[derive(Args, Debug)]
pub struct ExtractOpts {
    /// Path to the image to process.
    pub image: PathBuf,

    /// The enhancement backend to use.
    #[clap(long, default_value = "phi3")]
    pub backend: String,

    /// Language hints, as comma-separated codes (e.g. "en,fr").
    #[clap(long, value_delimiter = ',')]
    pub languages: Option<Vec<String>>,

    /// Require GPU execution. Fails outright if no compatible accelerator
    /// is present, rather than silently running slower.
    #[clap(long)]
    pub use_gpu: bool,

    /// Override the text model snapshot id.
    #[clap(long)]
    pub text_model: Option<String>,

    /// Override the vision model snapshot id.
    #[clap(long)]
    pub vision_model: Option<String>,

    /// Override the vision runner program name.
    #[clap(long)]
    pub vision_runner: Option<String>,

    /// Override the tesseract program name.
    #[clap(long)]
    pub tesseract_program: Option<String>,

    /// Override the neural recognizer program name.
    #[clap(long)]
    pub neural_program: Option<String>,

    /// Write the JSON result here instead of standard output.
    #[clap(short = 'o', long)]
    pub output: Option<PathBuf>,
}

/// The `extract` subcommand.
#[instrument(level = "debug", skip_all, fields(image = %opts.image.display()))]
pub async fn cmd_extract(opts: &ExtractOpts) -> Result<()> {
    let raw_bytes = tokio::fs::read(&opts.image)
        .await
        .with_context(|| format!("cannot read {}", opts.image.display()))?;

    let mut vision_model = VisionModelConfig::default();
    if let Some(model_id) = &opts.vision_model {
        vision_model.model_id = model_id.clone();
    }
    vision_model.program = opts.vision_runner.clone();

    let pipeline = Pipeline::new(PipelineConfig {
        tesseract_program: opts.tesseract_program.clone(),
        neural_program: opts.neural_program.clone(),
        engine_languages: opts.languages.clone().unwrap_or_default(),
        text_model_id: opts.text_model.clone(),
        vision_model,
    })?;

    let result = pipeline
        .run(
            &raw_bytes,
            &PipelineRequest {
                backend: opts.backend.clone(),
                languages: opts.languages.clone(),
                use_gpu: opts.use_gpu,
            },
        )
        .await?;

    write_json(opts.output.as_deref(), &result)
}
