//! Vector index abstraction and the default file-backed implementation.
//!
//! An index is filled exactly once per build and is read-only afterwards, so
//! queries never take a lock.

use crate::embeddings::cosine_similarity;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

const INDEX_FILE: &str = "index.json";

/// A chunk stored in the index together with its vector
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IndexEntry {
    /// Position of the chunk in build order
    pub id: u64,
    pub text: String,
    pub document_id: String,
    pub start_position: usize,
    pub vector: Vec<f32>,
}

/// A query hit
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredEntry {
    pub id: u64,
    pub text: String,
    pub document_id: String,
    pub score: f32,
}

/// Settings an index was built with; a persisted index is only reused when they match
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IndexManifest {
    pub embedder: String,
    pub dimensions: usize,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Bulk insert, once per build. Empty input is a no-op.
    async fn add(&self, entries: Vec<IndexEntry>) -> Result<()>;

    async fn count(&self) -> Result<usize>;

    /// The `k` entries most similar to `vector`, best first, ties by lower id
    async fn query(&self, vector: &[f32], k: usize) -> Result<Vec<ScoredEntry>>;

    /// Make the built index durable
    async fn persist(&self) -> Result<()> {
        Ok(())
    }
}

/// Order hits by descending score, then ascending id
pub(crate) fn rank(hits: &mut [ScoredEntry]) {
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then(a.id.cmp(&b.id))
    });
}

/// Write `value` to a temporary file next to `path` and rename it over `path`
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create directory {}", dir.display()))?;
    }

    let json = serde_json::to_vec(value).context("Failed to serialize index data")?;
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    fs::write(&tmp, json).with_context(|| format!("Failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("Failed to replace {}", path.display()))?;
    Ok(())
}

#[derive(Serialize, Deserialize)]
struct IndexFile {
    manifest: IndexManifest,
    entries: Vec<IndexEntry>,
}

#[derive(Serialize)]
struct IndexFileRef<'a> {
    manifest: &'a IndexManifest,
    entries: &'a [IndexEntry],
}

/// Exact cosine-similarity index kept in memory and saved as JSON in a directory
pub struct LocalIndex {
    dir: PathBuf,
    manifest: IndexManifest,
    entries: OnceLock<Vec<IndexEntry>>,
}

impl LocalIndex {
    /// An empty index that will be written to `dir`
    pub fn new<P: AsRef<Path>>(dir: P, manifest: IndexManifest) -> Self {
        LocalIndex {
            dir: dir.as_ref().to_path_buf(),
            manifest,
            entries: OnceLock::new(),
        }
    }

    /// Reload a previously persisted index; `None` if there is none in `dir`
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Option<Self>> {
        let dir = dir.as_ref();
        let path = dir.join(INDEX_FILE);

        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read index {}", path.display()))
            }
        };

        let file: IndexFile = serde_json::from_slice(&raw)
            .with_context(|| format!("Corrupt index file {}", path.display()))?;

        if let Some(entry) = file
            .entries
            .iter()
            .find(|e| e.vector.len() != file.manifest.dimensions)
        {
            bail!(
                "Index entry {} has {} dimensions, manifest says {}",
                entry.id,
                entry.vector.len(),
                file.manifest.dimensions
            );
        }

        info!(
            "Loaded {} index entries from {}",
            file.entries.len(),
            path.display()
        );

        Ok(Some(LocalIndex {
            dir: dir.to_path_buf(),
            manifest: file.manifest,
            entries: OnceLock::from(file.entries),
        }))
    }

    pub fn manifest(&self) -> &IndexManifest {
        &self.manifest
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    fn entries(&self) -> &[IndexEntry] {
        self.entries.get().map(Vec::as_slice).unwrap_or_default()
    }
}

#[async_trait]
impl VectorIndex for LocalIndex {
    async fn add(&self, entries: Vec<IndexEntry>) -> Result<()> {
        if entries.is_empty() {
            debug!("Nothing to add to the index");
            return Ok(());
        }

        if let Some(entry) = entries
            .iter()
            .find(|e| e.vector.len() != self.manifest.dimensions)
        {
            bail!(
                "Entry {} has {} dimensions, index expects {}",
                entry.id,
                entry.vector.len(),
                self.manifest.dimensions
            );
        }

        let added = entries.len();
        if self.entries.set(entries).is_err() {
            bail!("Index is already built; rebuild it instead of adding to it");
        }

        info!("Indexed {} entries", added);
        Ok(())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.len())
    }

    async fn query(&self, vector: &[f32], k: usize) -> Result<Vec<ScoredEntry>> {
        let entries = self.entries();
        if entries.is_empty() || k == 0 {
            return Ok(Vec::new());
        }

        if vector.len() != self.manifest.dimensions {
            bail!(
                "Query vector has {} dimensions, index expects {}",
                vector.len(),
                self.manifest.dimensions
            );
        }

        let mut hits: Vec<ScoredEntry> = entries
            .iter()
            .map(|entry| ScoredEntry {
                id: entry.id,
                text: entry.text.clone(),
                document_id: entry.document_id.clone(),
                score: cosine_similarity(&entry.vector, vector),
            })
            .collect();

        rank(&mut hits);
        hits.truncate(k);
        Ok(hits)
    }

    async fn persist(&self) -> Result<()> {
        let file = IndexFileRef {
            manifest: &self.manifest,
            entries: self.entries(),
        };
        let path = self.dir.join(INDEX_FILE);
        write_json_atomic(&path, &file)?;

        info!("Persisted {} index entries to {}", self.len(), path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn manifest(dimensions: usize) -> IndexManifest {
        IndexManifest {
            embedder: "test".to_string(),
            dimensions,
            chunk_size: 500,
            chunk_overlap: 100,
        }
    }

    fn entry(id: u64, text: &str, vector: Vec<f32>) -> IndexEntry {
        IndexEntry {
            id,
            text: text.to_string(),
            document_id: "doc.txt".to_string(),
            start_position: 0,
            vector,
        }
    }

    fn texts(hits: &[ScoredEntry]) -> Vec<&str> {
        hits.iter().map(|h| h.text.as_str()).collect()
    }

    #[tokio::test]
    async fn test_empty_index_returns_nothing() {
        let dir = tempdir().unwrap();
        let index = LocalIndex::new(dir.path(), manifest(2));
        assert_eq!(index.count().await.unwrap(), 0);
        assert!(index.query(&[1.0, 0.0], 3).await.unwrap().is_empty());

        index.add(Vec::new()).await.unwrap();
        assert_eq!(index.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_query_ranks_by_cosine_similarity() {
        let dir = tempdir().unwrap();
        let index = LocalIndex::new(dir.path(), manifest(2));
        index
            .add(vec![
                entry(0, "east", vec![1.0, 0.0]),
                entry(1, "north", vec![0.0, 1.0]),
                entry(2, "north-east", vec![1.0, 1.0]),
            ])
            .await
            .unwrap();

        let hits = index.query(&[0.1, 1.0], 2).await.unwrap();
        assert_eq!(texts(&hits), vec!["north", "north-east"]);
        assert!(hits[0].score >= hits[1].score);

        let all = index.query(&[0.1, 1.0], 10).await.unwrap();
        assert_eq!(all.len(), 3);

        assert!(index.query(&[0.1, 1.0], 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ties_break_by_lower_id() {
        let dir = tempdir().unwrap();
        let index = LocalIndex::new(dir.path(), manifest(2));
        index
            .add(vec![
                entry(0, "first", vec![1.0, 0.0]),
                entry(1, "second", vec![2.0, 0.0]),
                entry(2, "third", vec![3.0, 0.0]),
            ])
            .await
            .unwrap();

        let hits = index.query(&[1.0, 0.0], 3).await.unwrap();
        assert_eq!(texts(&hits), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn test_second_add_is_rejected() {
        let dir = tempdir().unwrap();
        let index = LocalIndex::new(dir.path(), manifest(2));
        index.add(vec![entry(0, "a", vec![1.0, 0.0])]).await.unwrap();
        assert!(index.add(vec![entry(1, "b", vec![0.0, 1.0])]).await.is_err());
        assert_eq!(index.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_dimension_mismatch_is_an_error() {
        let dir = tempdir().unwrap();
        let index = LocalIndex::new(dir.path(), manifest(2));
        assert!(index.add(vec![entry(0, "a", vec![1.0, 0.0, 0.0])]).await.is_err());

        index.add(vec![entry(0, "a", vec![1.0, 0.0])]).await.unwrap();
        assert!(index.query(&[1.0], 1).await.is_err());
    }

    #[tokio::test]
    async fn test_persist_and_reopen() {
        let dir = tempdir().unwrap();
        assert!(LocalIndex::open(dir.path()).unwrap().is_none());

        let index = LocalIndex::new(dir.path(), manifest(2));
        index
            .add(vec![
                entry(0, "east", vec![1.0, 0.0]),
                entry(1, "north", vec![0.0, 1.0]),
            ])
            .await
            .unwrap();
        index.persist().await.unwrap();

        let reopened = LocalIndex::open(dir.path()).unwrap().unwrap();
        assert_eq!(reopened.manifest(), &manifest(2));
        assert_eq!(reopened.count().await.unwrap(), 2);
        assert_eq!(
            reopened.query(&[0.0, 1.0], 1).await.unwrap(),
            index.query(&[0.0, 1.0], 1).await.unwrap()
        );
        assert!(!dir.path().join("index.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_empty_build_persists_as_empty_index() {
        let dir = tempdir().unwrap();
        let index = LocalIndex::new(dir.path().join("nested"), manifest(4));
        index.persist().await.unwrap();

        let reopened = LocalIndex::open(dir.path().join("nested")).unwrap().unwrap();
        assert_eq!(reopened.count().await.unwrap(), 0);
    }

    #[test]
    fn test_corrupt_index_is_an_error() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(INDEX_FILE), "{not json").unwrap();
        assert!(LocalIndex::open(dir.path()).is_err());
    }
}
