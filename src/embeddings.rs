use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Representation of a vector embedding
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn dimensions(&self) -> usize {
        self.values.len()
    }
}

/// Turns text into fixed-size vectors.
///
/// The same instance embeds chunks at build time and queries at request
/// time, so every vector it returns has `dimensions()` values.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Short identifier recorded next to a persisted index
    fn name(&self) -> &str;

    fn dimensions(&self) -> usize;

    /// One embedding per input, in input order
    async fn embed(&self, texts: &[&str]) -> Result<Vec<Embedding>>;

    async fn embed_query(&self, text: &str) -> Result<Embedding> {
        self.embed(&[text])
            .await?
            .into_iter()
            .next()
            .context("Embedder returned no vector for the query")
    }
}

/// Offline embedder based on FNV-1a feature hashing.
///
/// Lowercased word tokens (weight 1.0) and their character trigrams
/// (weight 0.5) are hashed into a fixed number of buckets and the result is
/// L2-normalized, so texts sharing words and word fragments land close
/// together under cosine similarity.
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dimensions: usize,
}

impl HashEmbedder {
    pub fn new(dimensions: usize) -> Result<Self> {
        if dimensions == 0 {
            bail!("embedding dimensions must be positive");
        }
        Ok(HashEmbedder { dimensions })
    }

    fn embed_one(&self, text: &str) -> Embedding {
        let mut values = vec![0.0f32; self.dimensions];

        for word in tokenize(text) {
            values[self.bucket(word.as_bytes())] += 1.0;

            let padded: Vec<char> = format!(" {} ", word).chars().collect();
            for trigram in padded.windows(3) {
                let trigram: String = trigram.iter().collect();
                values[self.bucket(trigram.as_bytes())] += 0.5;
            }
        }

        let norm: f32 = values.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            values.iter_mut().for_each(|v| *v /= norm);
        }

        Embedding { values }
    }

    fn bucket(&self, bytes: &[u8]) -> usize {
        (fnv1a(bytes) % self.dimensions as u64) as usize
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn name(&self) -> &str {
        "hash-fnv1a"
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed(&self, texts: &[&str]) -> Result<Vec<Embedding>> {
        Ok(texts.iter().map(|text| self.embed_one(text)).collect())
    }
}

/// Lowercased alphanumeric words
pub fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .map(|word| word.to_lowercase())
}

/// FNV-1a 64-bit; stable across builds, unlike the std hasher
fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

pub(crate) fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_dimensions_rejected() {
        assert!(HashEmbedder::new(0).is_err());
    }

    #[tokio::test]
    async fn test_embedding_is_deterministic() {
        let embedder = HashEmbedder::new(64).unwrap();
        let first = embedder.embed_query("The sky is blue.").await.unwrap();
        let second = embedder.embed_query("The sky is blue.").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.dimensions(), 64);

        let fresh = HashEmbedder::new(64).unwrap();
        assert_eq!(fresh.embed_query("The sky is blue.").await.unwrap(), first);
    }

    #[tokio::test]
    async fn test_batch_preserves_order() {
        let embedder = HashEmbedder::new(128).unwrap();
        let batch = embedder.embed(&["alpha", "beta", "gamma"]).await.unwrap();
        assert_eq!(batch.len(), 3);
        assert_eq!(batch[1], embedder.embed_query("beta").await.unwrap());
        assert_eq!(batch[2], embedder.embed_query("gamma").await.unwrap());
    }

    #[tokio::test]
    async fn test_vectors_are_normalized() {
        let embedder = HashEmbedder::new(32).unwrap();
        let embedding = embedder.embed_query("some words here").await.unwrap();
        let norm: f32 = embedding.values.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);

        let empty = embedder.embed_query("  ").await.unwrap();
        assert!(empty.values.iter().all(|v| *v == 0.0));
    }

    #[tokio::test]
    async fn test_related_text_scores_higher() {
        let embedder = HashEmbedder::new(384).unwrap();
        let query = embedder.embed_query("What color is the sky?").await.unwrap();
        let sky = embedder.embed_query("The sky is blue.").await.unwrap();
        let other = embedder.embed_query("Invoices are due within thirty days.").await.unwrap();

        assert!(
            cosine_similarity(&query.values, &sky.values)
                > cosine_similarity(&query.values, &other.values)
        );
    }

    #[test]
    fn test_tokenize() {
        let words: Vec<String> = tokenize("Hello, World! it's 2024").collect();
        assert_eq!(words, vec!["hello", "world", "it", "s", "2024"]);
    }

    #[test]
    fn test_cosine_similarity_edges() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert!((cosine_similarity(&[1.0, 0.0], &[2.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
    }
}
