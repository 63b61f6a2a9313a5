//! Local answer generation with a GGUF model run through llama.cpp.
//!
//! Inference is synchronous and CPU-bound, so every request runs on the
//! blocking pool with its own llama context. Sampling is greedy, so the same
//! prompt always gives the same answer.

use crate::generation::{GenerationRequest, Generator};
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaModel, Special};
use llama_cpp_2::sampling::LlamaSampler;
use log::{debug, info, warn};
use std::fs;
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const CONTEXT_TOKENS: u32 = 4096;
const MAX_ANSWER_TOKENS: usize = 256;
const PROMPT_BATCH: usize = 512;

/// Small models tend to continue with another question instead of stopping
const STOP_PATTERNS: &[&str] = &[
    "\nQuestion:",
    "\nContext:",
    "<|im_end|>",
    "<|endoftext|>",
    "<|end|>",
];

pub struct LlamaGenerator {
    model: Arc<LlamaModel>,
    backend: Arc<LlamaBackend>,
    name: String,
}

impl LlamaGenerator {
    /// Load a GGUF model from a file, or the first one found in a directory
    pub fn load(path: &Path) -> Result<Self> {
        let model_path = resolve_model_path(path)?;

        let backend = LlamaBackend::init().context("Failed to initialize llama.cpp backend")?;
        let params = LlamaModelParams::default();
        let model = LlamaModel::load_from_file(&backend, &model_path, &params)
            .map_err(|e| {
                anyhow!(
                    "Failed to load GGUF model from {}: {:?}",
                    model_path.display(),
                    e
                )
            })?;

        let name = model_path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "gguf".to_string());
        info!("Loaded local model {}", model_path.display());

        Ok(LlamaGenerator {
            model: Arc::new(model),
            backend: Arc::new(backend),
            name,
        })
    }

    fn run_inference(model: &LlamaModel, backend: &LlamaBackend, prompt: &str) -> Result<String> {
        let ctx_params =
            LlamaContextParams::default().with_n_ctx(NonZeroU32::new(CONTEXT_TOKENS));
        let mut ctx = model
            .new_context(backend, ctx_params)
            .map_err(|e| anyhow!("Failed to create llama context: {:?}", e))?;

        let tokens = model
            .str_to_token(prompt, AddBos::Always)
            .map_err(|e| anyhow!("Tokenization failed: {:?}", e))?;
        if tokens.is_empty() {
            bail!("Prompt produced no tokens");
        }

        // keep the tail: the question sits at the end of the prompt
        let max_prompt = CONTEXT_TOKENS as usize - MAX_ANSWER_TOKENS;
        let tokens = if tokens.len() > max_prompt {
            warn!(
                "Prompt of {} tokens truncated to {}",
                tokens.len(),
                max_prompt
            );
            tokens[tokens.len() - max_prompt..].to_vec()
        } else {
            tokens
        };

        let mut batch = LlamaBatch::new(PROMPT_BATCH, 1);
        let last = tokens.len() - 1;
        for (chunk_idx, chunk) in tokens.chunks(PROMPT_BATCH).enumerate() {
            batch.clear();
            for (i, token) in chunk.iter().enumerate() {
                let pos = chunk_idx * PROMPT_BATCH + i;
                batch
                    .add(*token, pos as i32, &[0], pos == last)
                    .map_err(|_| anyhow!("Failed to add prompt token to batch"))?;
            }
            ctx.decode(&mut batch)
                .map_err(|e| anyhow!("Prompt decode failed: {:?}", e))?;
        }

        let mut sampler = LlamaSampler::greedy();
        let eos = model.token_eos();
        let mut output = String::new();
        let mut pos = tokens.len() as i32;

        for _ in 0..MAX_ANSWER_TOKENS {
            let token = sampler.sample(&ctx, -1);
            if token == eos {
                break;
            }

            #[allow(deprecated)]
            let piece = model
                .token_to_str(token, Special::Tokenize)
                .unwrap_or_default();
            output.push_str(&piece);

            if let Some(cut) = stop_position(&output) {
                output.truncate(cut);
                break;
            }

            batch.clear();
            batch
                .add(token, pos, &[0], true)
                .map_err(|_| anyhow!("Failed to add generated token to batch"))?;
            pos += 1;
            ctx.decode(&mut batch)
                .map_err(|e| anyhow!("Decode failed: {:?}", e))?;
        }

        debug!(
            "Generated {} tokens from a {} token prompt",
            pos as usize - tokens.len(),
            tokens.len()
        );
        Ok(output.trim().to_string())
    }
}

#[async_trait]
impl Generator for LlamaGenerator {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(&self, request: &GenerationRequest<'_>) -> Result<String> {
        let model = Arc::clone(&self.model);
        let backend = Arc::clone(&self.backend);
        let prompt = format!("{}\nAnswer:", request.prompt);

        tokio::task::spawn_blocking(move || Self::run_inference(&model, &backend, &prompt))
            .await
            .map_err(|e| anyhow!("Inference task panicked: {}", e))?
    }
}

/// A `.gguf` file as given, or the first one (by name) inside a directory
fn resolve_model_path(path: &Path) -> Result<PathBuf> {
    let is_gguf = |p: &Path| p.extension().map(|e| e == "gguf").unwrap_or(false);

    if path.is_file() {
        if is_gguf(path) {
            return Ok(path.to_path_buf());
        }
        bail!("{} is not a GGUF model file", path.display());
    }

    if path.is_dir() {
        let mut models: Vec<PathBuf> = fs::read_dir(path)
            .with_context(|| format!("Failed to list {}", path.display()))?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|p| p.is_file() && is_gguf(p.as_path()))
            .collect();
        models.sort();
        if let Some(model) = models.into_iter().next() {
            return Ok(model);
        }
    }

    bail!("No GGUF model found at {}", path.display())
}

/// Byte offset of the earliest stop pattern in `text`
fn stop_position(text: &str) -> Option<usize> {
    STOP_PATTERNS
        .iter()
        .filter_map(|pattern| text.find(pattern))
        .min()
}
