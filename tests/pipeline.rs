use anyhow::{bail, Result};
use async_trait::async_trait;
use kb_rag::chunking::ChunkingConfig;
use kb_rag::config::{GeminiConfig, RagConfig};
use kb_rag::document::Document;
use kb_rag::embeddings::{Embedder, HashEmbedder};
use kb_rag::gemini::GeminiClient;
use kb_rag::generation::{AnswerGenerator, ExtractiveGenerator, GenerationRequest, Generator};
use kb_rag::index::{IndexManifest, LocalIndex};
use kb_rag::rag::{index_documents, QueryResponse, RagEngine, INSUFFICIENT_INFORMATION};
use kb_rag::retriever::Retriever;
use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::{tempdir, TempDir};
use tokio::net::TcpListener;

#[derive(Default)]
struct CountingGenerator {
    calls: AtomicUsize,
    fail: bool,
}

#[async_trait]
impl Generator for CountingGenerator {
    fn name(&self) -> &str {
        "counting"
    }

    async fn generate(&self, request: &GenerationRequest<'_>) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            bail!("simulated outage");
        }
        Ok(format!("answered from {} chunks", request.contexts.len()))
    }
}

fn config_with_corpus(dir: &TempDir, files: &[(&str, &str)]) -> RagConfig {
    let knowledge_base_path = dir.path().join("knowledge_base");
    fs::create_dir_all(&knowledge_base_path).unwrap();
    for (name, content) in files {
        fs::write(knowledge_base_path.join(name), content).unwrap();
    }

    RagConfig {
        knowledge_base_path,
        index_path: dir.path().join("index"),
        ..RagConfig::default()
    }
}

async fn engine_over(
    dir: &TempDir,
    texts: &[&str],
    generator: AnswerGenerator,
) -> RagEngine {
    let embedder = Arc::new(HashEmbedder::new(384).unwrap());
    let chunking = ChunkingConfig::default();
    let index = Arc::new(LocalIndex::new(
        dir.path().join("index"),
        IndexManifest {
            embedder: embedder.name().to_string(),
            dimensions: embedder.dimensions(),
            chunk_size: chunking.size,
            chunk_overlap: chunking.overlap,
        },
    ));

    let documents: Vec<Document> = texts
        .iter()
        .enumerate()
        .map(|(i, text)| Document {
            content: text.to_string(),
            document_id: format!("doc{}.txt", i),
        })
        .collect();
    index_documents(&documents, &chunking, embedder.as_ref(), index.as_ref())
        .await
        .unwrap();

    RagEngine::new(Retriever::new(embedder, index), generator, 3)
}

#[tokio::test]
async fn sky_scenario_answers_from_the_matching_chunk() {
    let dir = tempdir().unwrap();
    let config = config_with_corpus(&dir, &[("sky.txt", "The sky is blue.")]);
    let engine = RagEngine::build(&config, false).await.unwrap();

    let response = engine.answer_query("What color is the sky?").await.unwrap();
    assert!(response.answer.contains("blue"), "answer: {}", response.answer);
    assert_eq!(response.sources, vec!["The sky is blue."]);
}

#[tokio::test]
async fn empty_corpus_always_answers_insufficient_information() {
    let dir = tempdir().unwrap();
    let config = config_with_corpus(&dir, &[]);
    let engine = RagEngine::build(&config, false).await.unwrap();

    for query in ["anything", "What color is the sky?", "?"] {
        let response = engine.answer_query(query).await.unwrap();
        assert_eq!(response.answer, INSUFFICIENT_INFORMATION);
        assert!(response.sources.is_empty());
    }
}

#[tokio::test]
async fn generator_is_not_called_without_context() {
    let dir = tempdir().unwrap();
    let fallback = Arc::new(CountingGenerator::default());
    let engine = engine_over(&dir, &[], AnswerGenerator::new(fallback.clone())).await;

    let response = engine.answer_query("anything").await.unwrap();
    assert_eq!(response, QueryResponse::insufficient_information());

    let response = engine.answer_query_with_k("anything", 0).await.unwrap();
    assert_eq!(response, QueryResponse::insufficient_information());
    assert_eq!(fallback.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn k_zero_short_circuits_on_a_populated_index() {
    let dir = tempdir().unwrap();
    let fallback = Arc::new(CountingGenerator::default());
    let engine = engine_over(
        &dir,
        &["The sky is blue."],
        AnswerGenerator::new(fallback.clone()),
    )
    .await;

    let response = engine.answer_query_with_k("sky", 0).await.unwrap();
    assert_eq!(response, QueryResponse::insufficient_information());
    assert_eq!(fallback.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn failing_primary_falls_back_without_error() {
    let dir = tempdir().unwrap();
    let primary = Arc::new(CountingGenerator {
        fail: true,
        ..Default::default()
    });
    let generator =
        AnswerGenerator::new(Arc::new(ExtractiveGenerator::new())).with_primary(primary.clone());
    let engine = engine_over(&dir, &["The sky is blue."], generator).await;

    let response = engine.answer_query("What color is the sky?").await.unwrap();
    assert_eq!(response.answer, "The sky is blue.");
    assert_eq!(response.sources, vec!["The sky is blue."]);
    assert_eq!(primary.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unreachable_hosted_model_falls_back() {
    let dir = tempdir().unwrap();
    let hosted = GeminiClient::new(GeminiConfig {
        api_key: "test-key".to_string(),
        embeddings_url: "http://127.0.0.1:9/embed".to_string(),
        generate_url: "http://127.0.0.1:9/generate".to_string(),
        timeout: Duration::from_secs(2),
    })
    .unwrap();
    let generator =
        AnswerGenerator::new(Arc::new(ExtractiveGenerator::new())).with_primary(Arc::new(hosted));
    let engine = engine_over(&dir, &["The sky is blue."], generator).await;

    let response = engine.answer_query("What color is the sky?").await.unwrap();
    assert!(response.answer.contains("blue"));
}

#[tokio::test]
async fn silent_hosted_model_times_out_and_falls_back() {
    // accepts connections and never writes a byte back
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });

    let dir = tempdir().unwrap();
    let hosted = GeminiClient::new(GeminiConfig {
        api_key: "test-key".to_string(),
        embeddings_url: format!("http://{}/embed", addr),
        generate_url: format!("http://{}/generate", addr),
        timeout: Duration::from_secs(1),
    })
    .unwrap();
    let generator =
        AnswerGenerator::new(Arc::new(ExtractiveGenerator::new())).with_primary(Arc::new(hosted));
    let engine = engine_over(&dir, &["The sky is blue."], generator).await;

    let started = Instant::now();
    let response = engine.answer_query("What color is the sky?").await.unwrap();
    let elapsed = started.elapsed();
    server.abort();

    assert_eq!(response.answer, "The sky is blue.");
    assert!(elapsed >= Duration::from_millis(900), "returned after {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(5), "returned after {:?}", elapsed);
}

#[tokio::test]
async fn failing_fallback_is_reported() {
    let dir = tempdir().unwrap();
    let fallback = Arc::new(CountingGenerator {
        fail: true,
        ..Default::default()
    });
    let engine = engine_over(&dir, &["The sky is blue."], AnswerGenerator::new(fallback)).await;

    assert!(engine.answer_query("What color is the sky?").await.is_err());
}

#[tokio::test]
async fn sources_never_exceed_k_or_index_size() {
    let dir = tempdir().unwrap();
    let fallback = Arc::new(CountingGenerator::default());
    let engine = engine_over(
        &dir,
        &["Apples are red.", "Bananas are yellow.", "Grapes are purple."],
        AnswerGenerator::new(fallback),
    )
    .await;

    for k in 1..6 {
        let response = engine.answer_query_with_k("fruit colors", k).await.unwrap();
        assert_eq!(response.sources.len(), k.min(3));
    }
}

#[tokio::test]
async fn concurrent_queries_agree() {
    let dir = tempdir().unwrap();
    let engine = Arc::new(
        engine_over(
            &dir,
            &[
                "The sky is blue.",
                "Invoices are due within thirty days.",
                "The office opens at nine.",
            ],
            AnswerGenerator::new(Arc::new(ExtractiveGenerator::new())),
        )
        .await,
    );

    let expected = engine.answer_query("When does the office open?").await.unwrap();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.answer_query("When does the office open?").await })
        })
        .collect();

    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap(), expected);
    }
}

#[tokio::test]
async fn long_documents_are_chunked_and_retrieved() {
    let dir = tempdir().unwrap();
    let filler = "Lorem ipsum dolor sit amet, consectetur adipiscing elit. ".repeat(40);
    let text = format!("{}The warranty lasts two years. {}", filler, filler);
    let config = config_with_corpus(&dir, &[("manual.txt", text.as_str())]);
    let engine = RagEngine::build(&config, false).await.unwrap();

    let response = engine.answer_query("How long does the warranty last?").await.unwrap();
    assert!(response.sources.len() <= 3);
    assert!(response.sources.iter().all(|s| s.chars().count() <= 500));
    assert!(response.sources[0].contains("warranty"));
    assert!(response.answer.contains("two years"));
}
