use crate::config::GeminiConfig;
use crate::embeddings::{Embedder, Embedding};
use crate::generation::{GenerationRequest, Generator};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Vector size of `text-embedding-004`
pub const GEMINI_EMBEDDING_DIMENSIONS: usize = 768;

const EMBEDDING_MODEL: &str = "models/text-embedding-004";

// Keeps the key out of request URLs
const API_KEY_HEADER: &str = "x-goog-api-key";

/// Client for interacting with the Gemini API
#[derive(Clone)]
pub struct GeminiClient {
    config: GeminiConfig,
    client: reqwest::Client,
}

impl GeminiClient {
    /// Create a new Gemini client; every request is bounded by the configured timeout
    pub fn new(config: GeminiConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(GeminiClient { config, client })
    }

    /// Get the client configuration
    pub fn config(&self) -> &GeminiConfig {
        &self.config
    }

    /// Generate embeddings for a text
    pub async fn get_embedding(&self, text: &str) -> Result<Embedding> {
        #[derive(Serialize)]
        struct EmbeddingContent<'a> {
            parts: Vec<Part<'a>>,
        }

        #[derive(Serialize)]
        struct EmbeddingRequest<'a> {
            model: &'static str,
            content: EmbeddingContent<'a>,
        }

        let request = EmbeddingRequest {
            model: EMBEDDING_MODEL,
            content: EmbeddingContent {
                parts: vec![Part { text }],
            },
        };

        let response = self
            .client
            .post(&self.config.embeddings_url)
            .header(API_KEY_HEADER, &self.config.api_key)
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(anyhow!("API request failed: {} {}", status, error_text));
        }

        let response_data: EmbeddingResponse = response.json().await?;

        Ok(Embedding {
            values: response_data.embedding.values,
        })
    }

    /// Generate text for a complete prompt
    pub async fn generate_text(&self, prompt: &str) -> Result<String> {
        let request = GenerateRequest {
            contents: vec![Content::new_with_role(prompt, "user")],
            generation_config: GenerationConfig {
                temperature: 0.2,
                top_p: 0.8,
                top_k: 40,
                max_output_tokens: 1024,
            },
        };

        let response = self
            .client
            .post(&self.config.generate_url)
            .header(API_KEY_HEADER, &self.config.api_key)
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(anyhow!("API request failed: {} {}", status, error_text));
        }

        let response_data: GenerateResponse = response.json().await?;
        extract_text(response_data)
    }
}

/// Concatenate the parts of the first candidate
fn extract_text(response: GenerateResponse) -> Result<String> {
    let text = response
        .candidates
        .into_iter()
        .next()
        .and_then(|c| c.content)
        .map(|content| {
            content
                .parts
                .into_iter()
                .map(|p| p.text)
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default();

    if text.trim().is_empty() {
        return Err(anyhow!("No response generated"));
    }
    Ok(text.trim().to_string())
}

#[async_trait]
impl Embedder for GeminiClient {
    fn name(&self) -> &str {
        EMBEDDING_MODEL
    }

    fn dimensions(&self) -> usize {
        GEMINI_EMBEDDING_DIMENSIONS
    }

    async fn embed(&self, texts: &[&str]) -> Result<Vec<Embedding>> {
        let mut embeddings = Vec::with_capacity(texts.len());

        for text in texts {
            let embedding = self.get_embedding(text).await?;
            if embedding.dimensions() != GEMINI_EMBEDDING_DIMENSIONS {
                return Err(anyhow!(
                    "Gemini returned a {}-dimensional embedding, expected {}",
                    embedding.dimensions(),
                    GEMINI_EMBEDDING_DIMENSIONS
                ));
            }
            embeddings.push(embedding);
        }

        Ok(embeddings)
    }
}

#[async_trait]
impl Generator for GeminiClient {
    fn name(&self) -> &str {
        "gemini"
    }

    async fn generate(&self, request: &GenerationRequest<'_>) -> Result<String> {
        self.generate_text(&request.prompt).await
    }
}

#[derive(Deserialize, Debug)]
struct EmbeddingResponse {
    embedding: EmbeddingData,
}

#[derive(Deserialize, Debug)]
struct EmbeddingData {
    values: Vec<f32>,
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    contents: Vec<Content<'a>>,
    generation_config: GenerationConfig,
}

#[derive(Serialize)]
struct Content<'a> {
    parts: Vec<Part<'a>>,
    role: &'static str,
}

impl<'a> Content<'a> {
    fn new_with_role(text: &'a str, role: &'static str) -> Self {
        Content {
            parts: vec![Part { text }],
            role,
        }
    }
}

#[derive(Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Serialize)]
struct GenerationConfig {
    temperature: f32,
    top_p: f32,
    top_k: i32,
    max_output_tokens: i32,
}

#[derive(Deserialize, Debug)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

// A blocked candidate comes back without content
#[derive(Deserialize, Debug)]
struct Candidate {
    content: Option<ResponseContent>,
}

#[derive(Deserialize, Debug)]
struct ResponseContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Deserialize, Debug)]
struct ResponsePart {
    #[serde(default)]
    text: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::{AnswerGenerator, ExtractiveGenerator, PrimaryOutcome};
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    fn parse(value: serde_json::Value) -> Result<String> {
        extract_text(serde_json::from_value(value).unwrap())
    }

    #[test]
    fn test_extracts_first_candidate() {
        let text = parse(json!({
            "candidates": [
                {"content": {
                    "parts": [{"text": "The sky "}, {"text": "is blue."}],
                    "role": "model"
                }},
                {"content": {"parts": [{"text": "ignored"}]}}
            ]
        }))
        .unwrap();
        assert_eq!(text, "The sky is blue.");
    }

    #[test]
    fn test_empty_or_blocked_response_is_an_error() {
        assert!(parse(json!({})).is_err());
        assert!(parse(json!({"candidates": []})).is_err());
        assert!(parse(json!({"candidates": [{"finishReason": "SAFETY"}]})).is_err());
        assert!(parse(json!({"candidates": [{"content": {"parts": [{"text": "  "}]}}]})).is_err());
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_fails() {
        let client = GeminiClient::new(GeminiConfig {
            api_key: "test".to_string(),
            embeddings_url: "http://127.0.0.1:9/embed".to_string(),
            generate_url: "http://127.0.0.1:9/generate".to_string(),
            timeout: Duration::from_secs(2),
        })
        .unwrap();

        assert!(client.generate_text("hello").await.is_err());
        assert!(client.embed_query("hello").await.is_err());
    }

    #[tokio::test]
    async fn test_api_key_stays_out_of_error_messages() {
        let client = GeminiClient::new(GeminiConfig {
            api_key: "SECRET-API-KEY".to_string(),
            embeddings_url: "http://127.0.0.1:9/embed".to_string(),
            generate_url: "http://127.0.0.1:9/generate".to_string(),
            timeout: Duration::from_secs(2),
        })
        .unwrap();

        let generator = AnswerGenerator::new(Arc::new(ExtractiveGenerator::new()))
            .with_primary(Arc::new(client.clone()));
        let contexts = vec!["The sky is blue.".to_string()];
        let request = GenerationRequest::new("What color is the sky?", &contexts);

        match generator.try_primary(&request).await {
            PrimaryOutcome::Failed(e) => {
                let logged = format!("{:#}", e);
                assert!(logged.contains("127.0.0.1:9"), "{}", logged);
                assert!(!logged.contains("SECRET-API-KEY"), "{}", logged);
            }
            other => panic!("expected a failed hosted call, got {:?}", other),
        }

        let embed_error = format!("{:#}", client.embed_query("hello").await.unwrap_err());
        assert!(!embed_error.contains("SECRET-API-KEY"), "{}", embed_error);
    }
}
