use crate::chunking::ChunkingConfig;
use anyhow::{anyhow, bail, Context, Result};
use std::env;
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_GENERATE_URL: &str =
    "https://generativelanguage.googleapis.com/v1beta/models/gemini-1.5-flash:generateContent";
const DEFAULT_EMBEDDINGS_URL: &str =
    "https://generativelanguage.googleapis.com/v1beta/models/text-embedding-004:embedContent";

/// Whether the hosted model may be tried before the local one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmMode {
    Online,
    Offline,
}

impl FromStr for LlmMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "online" => Ok(LlmMode::Online),
            "offline" => Ok(LlmMode::Offline),
            other => Err(anyhow!("unknown LLM mode '{}' (expected online or offline)", other)),
        }
    }
}

/// Which embedder turns text into vectors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbeddingBackend {
    /// Local feature-hashing embedder, no network access
    Hash,
    /// Hosted Gemini embedding endpoint
    Gemini,
    /// Sentence-transformer exported to ONNX (all-MiniLM-L6-v2 by default);
    /// needs the `onnx` feature
    Onnx,
}

impl FromStr for EmbeddingBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "hash" | "local" => Ok(EmbeddingBackend::Hash),
            "gemini" => Ok(EmbeddingBackend::Gemini),
            "onnx" | "minilm" => Ok(EmbeddingBackend::Onnx),
            other => Err(anyhow!(
                "unknown embedding provider '{}' (expected hash, gemini or onnx)",
                other
            )),
        }
    }
}

/// The model behind the local answer tier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalGenerator {
    /// Quotes the best supported context sentences
    Extractive,
    /// GGUF model run through llama.cpp; needs the `llama` feature
    Llama,
}

impl FromStr for LocalGenerator {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "extractive" => Ok(LocalGenerator::Extractive),
            "llama" | "gguf" => Ok(LocalGenerator::Llama),
            other => Err(anyhow!(
                "unknown local generator '{}' (expected extractive or llama)",
                other
            )),
        }
    }
}

/// Configuration for the Gemini API
#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub api_key: String,
    pub embeddings_url: String,
    pub generate_url: String,
    pub timeout: Duration,
}

/// Configuration for Qdrant
#[derive(Debug, Clone)]
pub struct QdrantConfig {
    pub url: String,
    pub api_key: Option<String>,
    pub collection: String,
}

/// Everything the RAG engine needs, read once at startup
#[derive(Debug, Clone)]
pub struct RagConfig {
    /// Credential for the hosted model; `None` disables the primary tier for good
    pub api_key: Option<String>,
    pub llm_mode: LlmMode,
    pub generate_url: String,
    pub embeddings_url: String,
    pub embedding_backend: EmbeddingBackend,
    /// Vector size of the local hash embedder
    pub embedding_dimensions: usize,
    /// Directory holding `model.onnx` and `tokenizer.json` for the ONNX embedder
    pub embedding_model_path: PathBuf,
    pub local_generator: LocalGenerator,
    /// GGUF file (or a directory containing one) for the llama.cpp generator
    pub local_model_path: Option<PathBuf>,
    pub knowledge_base_path: PathBuf,
    pub index_path: PathBuf,
    pub qdrant: Option<QdrantConfig>,
    pub chunking: ChunkingConfig,
    pub top_k: usize,
    pub request_timeout: Duration,
}

impl Default for RagConfig {
    fn default() -> Self {
        RagConfig {
            api_key: None,
            llm_mode: LlmMode::Offline,
            generate_url: DEFAULT_GENERATE_URL.to_string(),
            embeddings_url: DEFAULT_EMBEDDINGS_URL.to_string(),
            embedding_backend: EmbeddingBackend::Hash,
            embedding_dimensions: 384,
            embedding_model_path: PathBuf::from("models/all-MiniLM-L6-v2"),
            local_generator: LocalGenerator::Extractive,
            local_model_path: None,
            knowledge_base_path: PathBuf::from("data/knowledge_base"),
            index_path: PathBuf::from("index_db"),
            qdrant: None,
            chunking: ChunkingConfig::default(),
            top_k: 3,
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl RagConfig {
    /// Create a new configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build the configuration from any key lookup; unset or blank keys take defaults
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let defaults = RagConfig::default();

        let api_key = get("GEMINI_API_KEY").or_else(|| get("GOOGLE_API_KEY"));
        let llm_mode = parse_or(get("LLM_MODE"), "LLM_MODE", defaults.llm_mode)?;
        let embedding_backend = parse_or(
            get("EMBEDDING_PROVIDER"),
            "EMBEDDING_PROVIDER",
            defaults.embedding_backend,
        )?;
        let embedding_dimensions = parse_or(
            get("EMBEDDING_DIMENSIONS"),
            "EMBEDDING_DIMENSIONS",
            defaults.embedding_dimensions,
        )?;

        let local_generator = parse_or(
            get("LOCAL_GENERATOR"),
            "LOCAL_GENERATOR",
            defaults.local_generator,
        )?;

        let chunk_size = parse_or(get("CHUNK_SIZE"), "CHUNK_SIZE", defaults.chunking.size)?;
        let chunk_overlap = parse_or(
            get("CHUNK_OVERLAP"),
            "CHUNK_OVERLAP",
            defaults.chunking.overlap,
        )?;
        let chunking = ChunkingConfig::new(chunk_size, chunk_overlap)
            .context("Invalid CHUNK_SIZE/CHUNK_OVERLAP")?;

        let top_k = parse_or(get("RETRIEVAL_K"), "RETRIEVAL_K", defaults.top_k)?;
        if top_k == 0 {
            bail!("RETRIEVAL_K must be a positive integer");
        }

        let timeout_secs: u64 = parse_or(
            get("GENERATION_TIMEOUT_SECS"),
            "GENERATION_TIMEOUT_SECS",
            defaults.request_timeout.as_secs(),
        )?;

        let qdrant = get("QDRANT_URL").map(|url| QdrantConfig {
            url,
            api_key: get("QDRANT_API_KEY"),
            collection: get("QDRANT_COLLECTION").unwrap_or_else(|| "knowledge_base".to_string()),
        });

        Ok(RagConfig {
            api_key,
            llm_mode,
            generate_url: get("GEMINI_GENERATE_URL").unwrap_or(defaults.generate_url),
            embeddings_url: get("GEMINI_EMBEDDINGS_URL").unwrap_or(defaults.embeddings_url),
            embedding_backend,
            embedding_dimensions,
            embedding_model_path: get("EMBEDDING_MODEL_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.embedding_model_path),
            local_generator,
            local_model_path: get("LOCAL_MODEL_PATH").map(PathBuf::from),
            knowledge_base_path: get("KNOWLEDGE_BASE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.knowledge_base_path),
            index_path: get("INDEX_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.index_path),
            qdrant,
            chunking,
            top_k,
            request_timeout: Duration::from_secs(timeout_secs),
        })
    }

    /// Gemini settings, present only when a credential is configured
    pub fn gemini(&self) -> Option<GeminiConfig> {
        self.api_key.as_ref().map(|api_key| GeminiConfig {
            api_key: api_key.clone(),
            embeddings_url: self.embeddings_url.clone(),
            generate_url: self.generate_url.clone(),
            timeout: self.request_timeout,
        })
    }

    /// The hosted tier runs only with a credential and online mode
    pub fn primary_enabled(&self) -> bool {
        self.api_key.is_some() && self.llm_mode == LlmMode::Online
    }
}

fn parse_or<T>(value: Option<String>, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match value {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow!("Invalid value for {}: '{}' ({})", name, raw, e)),
        None => Ok(default),
    }
}
