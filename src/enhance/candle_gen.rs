//! In-process causal-LM generation on candle.
//!
//! Loads a chat model snapshot (config + tokenizer + safetensors, sharded
//! or not) materialized by the [`ModelProvider`] and runs a plain greedy /
//! low-temperature decoding loop. The model's KV cache makes generation
//! stateful, so a single mutex serializes access per loaded instance;
//! inference itself runs on a blocking thread.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::generation::LogitsProcessor;
use candle_transformers::models::qwen2::{Config, ModelForCausalLM};
use parking_lot::Mutex;
use serde::Deserialize;
use tokenizers::Tokenizer;

use super::BackendError;
use super::generation::{GenerationRequest, Generator};
use crate::prelude::*;
use crate::provider::ModelProvider;

/// Fixed sampling seed, for reproducible correction runs.
const SEED: u64 = 299792458;

/// Sharded checkpoint manifest (`model.safetensors.index.json`).
#[derive(Deserialize)]
struct SafetensorsIndex {
    weight_map: std::collections::HashMap<String, String>,
}

/// A chat model loaded into this process.
pub struct CandleTextGenerator {
    model: Arc<Mutex<ModelForCausalLM>>,
    tokenizer: Arc<Tokenizer>,
    device: Device,
}

impl CandleTextGenerator {
    /// Materialize and load `model_id`. The provider call is idempotent, so
    /// this is cheap once the snapshot is on disk.
    pub async fn load(
        provider: &dyn ModelProvider,
        model_id: &str,
        use_gpu: bool,
    ) -> Result<Arc<dyn Generator>, BackendError> {
        let snapshot = provider
            .ensure_local(model_id, &["config.json", "tokenizer.json"])
            .await?;
        let weight_files = ensure_weight_files(provider, model_id).await?;
        info!(model_id, files = weight_files.len(), "model snapshot ready");

        let device = if use_gpu {
            Device::new_cuda(0)
                .map_err(|err| BackendError::ModelLoad(err.to_string()))?
        } else {
            Device::Cpu
        };

        let build_device = device.clone();
        let (model, tokenizer) = tokio::task::spawn_blocking(move || {
            let config: Config = serde_json::from_str(
                &std::fs::read_to_string(snapshot.join("config.json"))
                    .map_err(|err| BackendError::ModelLoad(err.to_string()))?,
            )
            .map_err(|err| BackendError::ModelLoad(err.to_string()))?;
            let tokenizer = Tokenizer::from_file(snapshot.join("tokenizer.json"))
                .map_err(|err| BackendError::ModelLoad(err.to_string()))?;
            let dtype = if build_device.is_cuda() {
                DType::BF16
            } else {
                DType::F32
            };
            let vb = unsafe {
                VarBuilder::from_mmaped_safetensors(
                    &weight_files,
                    dtype,
                    &build_device,
                )
                .map_err(|err| BackendError::ModelLoad(err.to_string()))?
            };
            let model = ModelForCausalLM::new(&config, vb)
                .map_err(|err| BackendError::ModelLoad(err.to_string()))?;
            Ok::<_, BackendError>((model, tokenizer))
        })
        .await
        .map_err(|err| BackendError::ModelLoad(err.to_string()))??;

        Ok(Arc::new(Self {
            model: Arc::new(Mutex::new(model)),
            tokenizer: Arc::new(tokenizer),
            device,
        }))
    }

    fn stop_tokens(&self) -> Vec<u32> {
        ["<|im_end|>", "<|endoftext|>"]
            .iter()
            .filter_map(|token| self.tokenizer.token_to_id(token))
            .collect()
    }
}

#[async_trait]
impl Generator for CandleTextGenerator {
    #[instrument(level = "debug", skip_all, fields(max_new_tokens = req.max_new_tokens))]
    async fn generate(
        &self,
        req: GenerationRequest<'_>,
    ) -> Result<String, BackendError> {
        let model = Arc::clone(&self.model);
        let tokenizer = Arc::clone(&self.tokenizer);
        let device = self.device.clone();
        let stop_tokens = self.stop_tokens();
        let prompt = req.prompt.to_string();
        let max_new_tokens = req.max_new_tokens;
        let temperature = req.temperature;

        tokio::task::spawn_blocking(move || {
            run_decode_loop(
                &model,
                &tokenizer,
                &device,
                &stop_tokens,
                &prompt,
                max_new_tokens,
                temperature,
            )
        })
        .await
        .map_err(|err| BackendError::Generation(err.to_string()))?
    }
}

/// The decoding loop proper. Returns the decode of the whole sequence
/// (prompt tokens included) with special tokens retained, so the caller
/// sees its own framing echoed ahead of the completion.
fn run_decode_loop(
    model: &Mutex<ModelForCausalLM>,
    tokenizer: &Tokenizer,
    device: &Device,
    stop_tokens: &[u32],
    prompt: &str,
    max_new_tokens: usize,
    temperature: Option<f64>,
) -> Result<String, BackendError> {
    let generation_err = |err: candle_core::Error| {
        BackendError::Generation(err.to_string())
    };

    let encoding = tokenizer
        .encode(prompt, true)
        .map_err(|err| BackendError::Generation(err.to_string()))?;
    let mut tokens: Vec<u32> = encoding.get_ids().to_vec();
    if tokens.is_empty() {
        return Err(BackendError::Generation(
            "prompt encoded to zero tokens".to_string(),
        ));
    }

    let mut model = model.lock();
    model.clear_kv_cache();
    let mut logits_processor = LogitsProcessor::new(SEED, temperature, None);

    for index in 0..max_new_tokens {
        let context_size = if index > 0 { 1 } else { tokens.len() };
        let start_pos = tokens.len().saturating_sub(context_size);
        let input = Tensor::new(&tokens[start_pos..], device)
            .and_then(|t| t.unsqueeze(0))
            .map_err(generation_err)?;
        let logits = model
            .forward(&input, start_pos)
            .and_then(|l| l.squeeze(0))
            .and_then(|l| l.squeeze(0))
            .and_then(|l| l.to_dtype(DType::F32))
            .map_err(generation_err)?;
        let next = logits_processor.sample(&logits).map_err(generation_err)?;
        tokens.push(next);
        if stop_tokens.contains(&next) {
            break;
        }
    }

    tokenizer
        .decode(&tokens, false)
        .map_err(|err| BackendError::Generation(err.to_string()))
}

/// Materialize the checkpoint weights, following the sharding manifest when
/// the snapshot has one.
async fn ensure_weight_files(
    provider: &dyn ModelProvider,
    model_id: &str,
) -> Result<Vec<PathBuf>, BackendError> {
    match provider
        .ensure_local(model_id, &["model.safetensors.index.json"])
        .await
    {
        Ok(snapshot) => {
            let manifest = std::fs::read_to_string(
                snapshot.join("model.safetensors.index.json"),
            )
            .map_err(|err| BackendError::ModelLoad(err.to_string()))?;
            let index: SafetensorsIndex = serde_json::from_str(&manifest)
                .map_err(|err| BackendError::ModelLoad(err.to_string()))?;
            let shards: BTreeSet<String> =
                index.weight_map.into_values().collect();
            let shard_refs: Vec<&str> =
                shards.iter().map(String::as_str).collect();
            let snapshot = provider.ensure_local(model_id, &shard_refs).await?;
            Ok(shards.iter().map(|shard| snapshot.join(shard)).collect())
        }
        // No manifest: a single-file checkpoint.
        Err(_) => {
            let snapshot = provider
                .ensure_local(model_id, &["model.safetensors"])
                .await?;
            Ok(vec![snapshot.join("model.safetensors")])
        }
    }
}
