use crate::chunking::{split_document, ChunkingConfig, TextChunk};
use crate::config::{EmbeddingBackend, LocalGenerator, RagConfig};
use crate::database::QdrantIndex;
use crate::document::{load_documents, Document};
use crate::embeddings::{Embedder, HashEmbedder};
use crate::gemini::GeminiClient;
use crate::generation::{AnswerGenerator, ExtractiveGenerator, Generator};
use crate::index::{IndexEntry, IndexManifest, LocalIndex, VectorIndex};
use crate::retriever::Retriever;
use anyhow::{bail, Context, Result};
use log::{debug, info, warn};
use serde::Serialize;
use std::io::{self, Write};
use std::sync::Arc;

/// Answer given when there is nothing to ground a response on
pub const INSUFFICIENT_INFORMATION: &str =
    "I don't have enough information in my knowledge base yet.";

/// Chunks embedded per embedder call while building the index
const EMBED_BATCH: usize = 64;

/// What callers get back for a question
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryResponse {
    pub answer: String,
    pub sources: Vec<String>,
}

impl QueryResponse {
    pub fn insufficient_information() -> Self {
        QueryResponse {
            answer: INSUFFICIENT_INFORMATION.to_string(),
            sources: Vec::new(),
        }
    }
}

/// RAG (Retrieval-Augmented Generation) engine
pub struct RagEngine {
    retriever: Retriever,
    generator: AnswerGenerator,
    top_k: usize,
}

impl RagEngine {
    /// Create a new RAG engine from already built parts
    pub fn new(retriever: Retriever, generator: AnswerGenerator, top_k: usize) -> Self {
        RagEngine {
            retriever,
            generator,
            top_k,
        }
    }

    /// Construct every collaborator from configuration and make the index ready.
    ///
    /// A persisted index built with the same settings is reused unless
    /// `rebuild` is set; otherwise the knowledge base is ingested from scratch.
    /// Any failure here is fatal: the engine is never half-initialized.
    pub async fn build(config: &RagConfig, rebuild: bool) -> Result<Self> {
        let embedder = build_embedder(config).await?;
        let (index, needs_build) = open_index(config, embedder.as_ref(), rebuild).await?;

        if needs_build {
            let documents = load_documents(&config.knowledge_base_path);
            index_documents(&documents, &config.chunking, embedder.as_ref(), index.as_ref())
                .await
                .context("Failed to build the index")?;
        }

        let generator = build_generator(config)?;
        info!(
            "RAG engine ready with {} indexed chunks",
            index.count().await?
        );

        Ok(RagEngine::new(
            Retriever::new(embedder, index),
            generator,
            config.top_k,
        ))
    }

    /// Answer a question from the knowledge base with the configured `k`
    pub async fn answer_query(&self, query: &str) -> Result<QueryResponse> {
        self.answer_query_with_k(query, self.top_k).await
    }

    /// Answer a question using the `k` best chunks.
    ///
    /// An empty index or empty retrieval yields the insufficient-information
    /// answer without calling any model. Errors only come from retrieval or
    /// from the local model; hosted-model failures are absorbed.
    pub async fn answer_query_with_k(&self, query: &str, k: usize) -> Result<QueryResponse> {
        if self.retriever.index().count().await? == 0 {
            debug!("Index is empty, nothing to answer from");
            return Ok(QueryResponse::insufficient_information());
        }

        let contexts = self.retriever.retrieve(query, k).await?;
        if contexts.is_empty() {
            return Ok(QueryResponse::insufficient_information());
        }

        let answer = self
            .generator
            .generate(query, &contexts)
            .await
            .context("Failed to generate an answer")?;

        Ok(QueryResponse {
            answer,
            sources: contexts,
        })
    }

    /// Run the interactive question loop on stdin
    pub async fn run_query_loop(&self) -> Result<()> {
        println!("Ready to answer questions. Type 'exit' to quit.");

        let stdin = io::stdin();
        let mut stdout = io::stdout();
        let mut buffer = String::new();

        loop {
            print!("\nYour question: ");
            stdout.flush()?;

            buffer.clear();
            if stdin.read_line(&mut buffer)? == 0 {
                break;
            }

            let question = buffer.trim();
            if question.is_empty() {
                continue;
            }
            if question.to_lowercase() == "exit" {
                println!("Goodbye!");
                break;
            }

            let response = self.answer_query(question).await?;

            println!("\n{}", response.answer);
            for (idx, source) in response.sources.iter().enumerate() {
                println!("  [{}] {}", idx + 1, preview(source));
            }
        }

        Ok(())
    }
}

/// Chunk, embed and store a corpus, then make the index durable.
///
/// Chunk ids follow build order across all documents. Returns the number
/// of chunks indexed.
pub async fn index_documents(
    documents: &[Document],
    chunking: &ChunkingConfig,
    embedder: &dyn Embedder,
    index: &dyn VectorIndex,
) -> Result<usize> {
    let chunks: Vec<TextChunk> = documents
        .iter()
        .flat_map(|document| split_document(document, chunking))
        .collect();
    info!(
        "Split {} documents into {} chunks",
        documents.len(),
        chunks.len()
    );

    let mut entries = Vec::with_capacity(chunks.len());
    for batch in chunks.chunks(EMBED_BATCH) {
        let texts: Vec<&str> = batch.iter().map(|chunk| chunk.text.as_str()).collect();
        let embeddings = embedder.embed(&texts).await?;
        if embeddings.len() != batch.len() {
            bail!(
                "Embedder returned {} vectors for {} chunks",
                embeddings.len(),
                batch.len()
            );
        }

        for (chunk, embedding) in batch.iter().zip(embeddings) {
            entries.push(IndexEntry {
                id: entries.len() as u64,
                text: chunk.text.clone(),
                document_id: chunk.document_id.clone(),
                start_position: chunk.start_position,
                vector: embedding.values,
            });
        }
    }

    let indexed = entries.len();
    index.add(entries).await?;
    index.persist().await?;
    Ok(indexed)
}

/// Load the embedding model and make sure it produces vectors
async fn build_embedder(config: &RagConfig) -> Result<Arc<dyn Embedder>> {
    let embedder: Arc<dyn Embedder> = match config.embedding_backend {
        EmbeddingBackend::Hash => Arc::new(HashEmbedder::new(config.embedding_dimensions)?),
        EmbeddingBackend::Gemini => {
            let gemini = config
                .gemini()
                .context("EMBEDDING_PROVIDER=gemini requires GEMINI_API_KEY")?;
            Arc::new(GeminiClient::new(gemini)?)
        }
        EmbeddingBackend::Onnx => onnx_embedder(config)?,
    };

    let sample = embedder
        .embed_query("embedding model check")
        .await
        .with_context(|| format!("Embedding model {} failed to load", embedder.name()))?;
    if sample.dimensions() != embedder.dimensions() {
        bail!(
            "Embedding model {} produced {} dimensions, expected {}",
            embedder.name(),
            sample.dimensions(),
            embedder.dimensions()
        );
    }

    info!(
        "Using embedder {} ({} dimensions)",
        embedder.name(),
        embedder.dimensions()
    );
    Ok(embedder)
}

/// Open the configured index; the flag says whether it still has to be filled
async fn open_index(
    config: &RagConfig,
    embedder: &dyn Embedder,
    rebuild: bool,
) -> Result<(Arc<dyn VectorIndex>, bool)> {
    let manifest = IndexManifest {
        embedder: embedder.name().to_string(),
        dimensions: embedder.dimensions(),
        chunk_size: config.chunking.size,
        chunk_overlap: config.chunking.overlap,
    };

    if let Some(qdrant) = &config.qdrant {
        let index = QdrantIndex::connect(qdrant, manifest.clone(), &config.index_path)?;
        let stale = if rebuild {
            Some("rebuild requested")
        } else {
            index.state().await?.stale_reason(&manifest)
        };

        let needs_build = match stale {
            Some(reason) => {
                info!("Rebuilding Qdrant collection: {}", reason);
                index.recreate_collection().await?;
                true
            }
            None => {
                info!("Using existing Qdrant collection");
                false
            }
        };
        let index: Arc<dyn VectorIndex> = Arc::new(index);
        return Ok((index, needs_build));
    }

    if !rebuild {
        match LocalIndex::open(&config.index_path) {
            Ok(Some(index)) if index.manifest() != &manifest => {
                info!("Index was built with different settings, rebuilding")
            }
            Ok(Some(index)) if index.is_empty() => {
                info!("Persisted index is empty, rescanning the knowledge base")
            }
            Ok(Some(index)) => {
                let index: Arc<dyn VectorIndex> = Arc::new(index);
                return Ok((index, false));
            }
            Ok(None) => info!("No index at {}, building", config.index_path.display()),
            Err(e) => warn!("Ignoring unreadable index: {:#}", e),
        }
    }

    let index: Arc<dyn VectorIndex> = Arc::new(LocalIndex::new(&config.index_path, manifest));
    Ok((index, true))
}

#[cfg(feature = "onnx")]
fn onnx_embedder(config: &RagConfig) -> Result<Arc<dyn Embedder>> {
    let embedder = crate::onnx::OnnxEmbedder::load(&config.embedding_model_path)?;
    Ok(Arc::new(embedder))
}

#[cfg(not(feature = "onnx"))]
fn onnx_embedder(_config: &RagConfig) -> Result<Arc<dyn Embedder>> {
    bail!("EMBEDDING_PROVIDER=onnx needs kb-rag built with the `onnx` feature")
}

/// The model behind the local tier, loaded now so a broken model stops startup
fn build_local_generator(config: &RagConfig) -> Result<Arc<dyn Generator>> {
    match config.local_generator {
        LocalGenerator::Extractive => Ok(Arc::new(ExtractiveGenerator::new())),
        LocalGenerator::Llama => {
            let path = config
                .local_model_path
                .as_deref()
                .context("LOCAL_GENERATOR=llama requires LOCAL_MODEL_PATH")?;
            llama_generator(path)
        }
    }
}

#[cfg(feature = "llama")]
fn llama_generator(path: &std::path::Path) -> Result<Arc<dyn Generator>> {
    Ok(Arc::new(crate::llama::LlamaGenerator::load(path)?))
}

#[cfg(not(feature = "llama"))]
fn llama_generator(_path: &std::path::Path) -> Result<Arc<dyn Generator>> {
    bail!("LOCAL_GENERATOR=llama needs kb-rag built with the `llama` feature")
}

/// The local tier always exists; the hosted tier only in online mode with a key
fn build_generator(config: &RagConfig) -> Result<AnswerGenerator> {
    let local = build_local_generator(config)?;
    info!("Local model: {}", local.name());
    let generator = AnswerGenerator::new(local);

    if !config.primary_enabled() {
        info!("Answering with the local model only");
        return Ok(generator);
    }

    let gemini = config
        .gemini()
        .context("Online mode requires GEMINI_API_KEY")?;
    info!("Answering with Gemini, falling back to the local model");
    Ok(generator.with_primary(Arc::new(GeminiClient::new(gemini)?)))
}

fn preview(text: &str) -> String {
    const PREVIEW_CHARS: usize = 120;
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= PREVIEW_CHARS {
        return flat;
    }
    let cut: String = flat.chars().take(PREVIEW_CHARS).collect();
    format!("{}...", cut)
}
