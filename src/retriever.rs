use crate::embeddings::Embedder;
use crate::index::{ScoredEntry, VectorIndex};
use anyhow::{Context, Result};
use log::debug;
use std::sync::Arc;

/// Finds the chunks closest to a question
#[derive(Clone)]
pub struct Retriever {
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
}

impl Retriever {
    pub fn new(embedder: Arc<dyn Embedder>, index: Arc<dyn VectorIndex>) -> Self {
        Retriever { embedder, index }
    }

    /// Chunk texts for the `k` best matches, best first
    pub async fn retrieve(&self, query: &str, k: usize) -> Result<Vec<String>> {
        Ok(self
            .retrieve_scored(query, k)
            .await?
            .into_iter()
            .map(|hit| hit.text)
            .collect())
    }

    /// Like [`Retriever::retrieve`] but keeps scores and provenance.
    ///
    /// An empty index simply yields no hits; callers that need to skip the
    /// query embedding check `count()` themselves.
    pub async fn retrieve_scored(&self, query: &str, k: usize) -> Result<Vec<ScoredEntry>> {
        if k == 0 {
            return Ok(Vec::new());
        }

        let query_embedding = self
            .embedder
            .embed_query(query)
            .await
            .context("Failed to embed query")?;

        let hits = self.index.query(&query_embedding.values, k).await?;
        debug!("Retrieved {} chunks (k = {})", hits.len(), k);
        Ok(hits)
    }

    pub fn index(&self) -> &Arc<dyn VectorIndex> {
        &self.index
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::HashEmbedder;
    use crate::index::{IndexEntry, IndexManifest, LocalIndex};
    use tempfile::tempdir;

    async fn retriever_over(texts: &[&str]) -> (Retriever, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let embedder = HashEmbedder::new(256).unwrap();
        let index = LocalIndex::new(
            dir.path(),
            IndexManifest {
                embedder: embedder.name().to_string(),
                dimensions: 256,
                chunk_size: 500,
                chunk_overlap: 100,
            },
        );

        let vectors = embedder.embed(texts).await.unwrap();
        let entries = texts
            .iter()
            .zip(vectors)
            .enumerate()
            .map(|(id, (text, embedding))| IndexEntry {
                id: id as u64,
                text: text.to_string(),
                document_id: "corpus.txt".to_string(),
                start_position: 0,
                vector: embedding.values,
            })
            .collect();
        index.add(entries).await.unwrap();

        (Retriever::new(Arc::new(embedder), Arc::new(index)), dir)
    }

    #[tokio::test]
    async fn test_retrieves_most_relevant_first() {
        let (retriever, _dir) = retriever_over(&[
            "Invoices are due within thirty days.",
            "The sky is blue.",
            "Grass is green in spring.",
        ])
        .await;

        let results = retriever.retrieve("What color is the sky?", 1).await.unwrap();
        assert_eq!(results, vec!["The sky is blue."]);
    }

    #[tokio::test]
    async fn test_never_more_than_k_or_count() {
        let (retriever, _dir) = retriever_over(&["one", "two", "three", "four"]).await;

        for k in 0..7 {
            let results = retriever.retrieve("two", k).await.unwrap();
            assert_eq!(results.len(), k.min(4));
        }
    }

    #[tokio::test]
    async fn test_empty_index_returns_nothing() {
        let (retriever, _dir) = retriever_over(&[]).await;
        assert!(retriever.retrieve("anything", 3).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_scores_are_descending() {
        let (retriever, _dir) =
            retriever_over(&["red apples", "green apples", "blue sky", "apples and pears"]).await;

        let hits = retriever.retrieve_scored("apples", 4).await.unwrap();
        assert!(hits.windows(2).all(|pair| pair[0].score >= pair[1].score));
    }
}
