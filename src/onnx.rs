//! Sentence embeddings from a transformer exported to ONNX.
//!
//! The model directory holds `model.onnx` (or an optimized `model_O4.onnx`)
//! and the matching `tokenizer.json`, e.g. an ONNX export of
//! all-MiniLM-L6-v2. Token embeddings are mean-pooled over the attention
//! mask and L2-normalized.

use crate::embeddings::{Embedder, Embedding};
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use log::info;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::Value;
use parking_lot::Mutex;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokenizers::Tokenizer;

/// Longer inputs are truncated; chunks are far below this in practice
const MAX_TOKENS: usize = 256;

const INFERENCE_BATCH: usize = 16;

/// Local sentence-embedding model
#[derive(Clone)]
pub struct OnnxEmbedder {
    session: Arc<Mutex<Session>>,
    tokenizer: Arc<Tokenizer>,
    name: String,
    dimensions: usize,
}

impl OnnxEmbedder {
    /// Load the model and tokenizer and run one embedding to learn the vector size
    pub fn load(model_dir: &Path) -> Result<Self> {
        let model_path = find_model(model_dir)?;
        let tokenizer_path = model_dir.join("tokenizer.json");
        if !tokenizer_path.exists() {
            bail!("Tokenizer not found at: {}", tokenizer_path.display());
        }

        let tokenizer = Tokenizer::from_file(&tokenizer_path).map_err(|e| {
            anyhow!(
                "Failed to load tokenizer {}: {}",
                tokenizer_path.display(),
                e
            )
        })?;

        let model_bytes = fs::read(&model_path)
            .with_context(|| format!("Failed to read model {}", model_path.display()))?;
        let session = Session::builder()
            .map_err(|e| anyhow!("Session builder: {:?}", e))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| anyhow!("Optimization level: {:?}", e))?
            .commit_from_memory(&model_bytes)
            .map_err(|e| anyhow!("Failed to load model {}: {:?}", model_path.display(), e))?;

        let model_name = model_dir
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "model".to_string());

        let mut embedder = OnnxEmbedder {
            session: Arc::new(Mutex::new(session)),
            tokenizer: Arc::new(tokenizer),
            name: format!("onnx:{}", model_name),
            dimensions: 0,
        };

        let sample = embedder.embed_blocking(&["dimension check".to_string()])?;
        embedder.dimensions = sample.first().map(Vec::len).unwrap_or(0);
        if embedder.dimensions == 0 {
            bail!("{} produced an empty embedding", model_path.display());
        }

        info!(
            "Loaded ONNX embedding model {} ({} dimensions)",
            model_path.display(),
            embedder.dimensions
        );
        Ok(embedder)
    }

    fn embed_blocking(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut embeddings = Vec::with_capacity(texts.len());

        for batch in texts.chunks(INFERENCE_BATCH) {
            let encodings = self
                .tokenizer
                .encode_batch(batch.to_vec(), true)
                .map_err(|e| anyhow!("Tokenization failed: {}", e))?;

            let batch_size = encodings.len();
            let padded_len = encodings
                .iter()
                .map(|encoding| encoding.get_ids().len().min(MAX_TOKENS))
                .max()
                .unwrap_or(0)
                .max(1);

            let mut ids = Vec::with_capacity(batch_size * padded_len);
            let mut mask = Vec::with_capacity(batch_size * padded_len);
            let mut type_ids = Vec::with_capacity(batch_size * padded_len);

            for encoding in &encodings {
                let len = encoding.get_ids().len().min(MAX_TOKENS);
                ids.extend(encoding.get_ids()[..len].iter().map(|&id| id as i64));
                mask.extend(encoding.get_attention_mask()[..len].iter().map(|&m| m as i64));
                type_ids.extend(encoding.get_type_ids()[..len].iter().map(|&t| t as i64));
                for _ in len..padded_len {
                    ids.push(0);
                    mask.push(0);
                    type_ids.push(0);
                }
            }

            let shape = vec![batch_size, padded_len];
            let input_ids = Value::from_array((shape.clone(), ids))
                .map_err(|e| anyhow!("input_ids tensor: {:?}", e))?;
            let attention_mask = Value::from_array((shape.clone(), mask.clone()))
                .map_err(|e| anyhow!("attention_mask tensor: {:?}", e))?;
            let token_type_ids = Value::from_array((shape, type_ids))
                .map_err(|e| anyhow!("token_type_ids tensor: {:?}", e))?;

            let inputs = ort::inputs![
                "input_ids" => input_ids,
                "attention_mask" => attention_mask,
                "token_type_ids" => token_type_ids,
            ];

            let mut session = self.session.lock();
            let outputs = session
                .run(inputs)
                .map_err(|e| anyhow!("Inference failed: {:?}", e))?;

            // sentence-transformers exports call it token_embeddings
            let output_name = outputs
                .iter()
                .map(|(name, _)| name.to_string())
                .find(|name| name == "last_hidden_state" || name == "token_embeddings")
                .or_else(|| outputs.iter().next().map(|(name, _)| name.to_string()))
                .context("Model produced no outputs")?;

            let (shape, data) = outputs[output_name.as_str()]
                .try_extract_tensor::<f32>()
                .map_err(|e| anyhow!("Failed to extract output '{}': {:?}", output_name, e))?;
            if shape.len() != 3 {
                bail!(
                    "Output '{}' has {} axes, expected [batch, tokens, hidden]",
                    output_name,
                    shape.len()
                );
            }

            let seq_len = shape[1] as usize;
            let hidden = shape[2] as usize;
            for sample in 0..batch_size {
                let tokens = &data[sample * seq_len * hidden..(sample + 1) * seq_len * hidden];
                let sample_mask = &mask[sample * padded_len..(sample + 1) * padded_len];
                embeddings.push(mean_pool(tokens, sample_mask, hidden));
            }
        }

        Ok(embeddings)
    }
}

#[async_trait]
impl Embedder for OnnxEmbedder {
    fn name(&self) -> &str {
        &self.name
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed(&self, texts: &[&str]) -> Result<Vec<Embedding>> {
        let texts: Vec<String> = texts.iter().map(|text| text.to_string()).collect();
        let embedder = self.clone();

        let vectors = tokio::task::spawn_blocking(move || embedder.embed_blocking(&texts))
            .await
            .map_err(|e| anyhow!("Embedding task panicked: {}", e))??;

        Ok(vectors
            .into_iter()
            .map(|values| Embedding { values })
            .collect())
    }
}

fn find_model(model_dir: &Path) -> Result<PathBuf> {
    let candidates = [
        model_dir.join("model_O4.onnx"),
        model_dir.join("model.onnx"),
        model_dir.join("onnx").join("model.onnx"),
    ];
    candidates
        .into_iter()
        .find(|path| path.exists())
        .ok_or_else(|| anyhow!("No ONNX model found in: {}", model_dir.display()))
}

/// Average the token vectors the mask keeps, then L2-normalize
fn mean_pool(tokens: &[f32], mask: &[i64], hidden: usize) -> Vec<f32> {
    let mut pooled = vec![0.0f32; hidden];
    let mut kept = 0.0f32;

    for (row, &m) in tokens.chunks(hidden).zip(mask) {
        if m > 0 {
            kept += 1.0;
            pooled.iter_mut().zip(row).for_each(|(p, v)| *p += v);
        }
    }

    if kept > 0.0 {
        pooled.iter_mut().for_each(|p| *p /= kept);
    }

    let norm: f32 = pooled.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 1e-12 {
        pooled.iter_mut().for_each(|p| *p /= norm);
    }
    pooled
}
