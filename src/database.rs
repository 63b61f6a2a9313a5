use crate::config::QdrantConfig;
use crate::index::{
    rank, write_json_atomic, IndexEntry, IndexManifest, ScoredEntry, VectorIndex,
};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use log::{info, warn};
use qdrant_client::qdrant::{
    vectors_config, with_payload_selector, CountPointsBuilder, CreateCollectionBuilder, Distance,
    PointStruct, SearchPoints, UpsertPointsBuilder, VectorParams, WithPayloadSelector,
};
use qdrant_client::{Payload, Qdrant};
use serde_json::json;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

const UPSERT_BATCH: usize = 256;

/// What is known about a collection before deciding whether to reuse it
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionState {
    pub exists: bool,
    pub points: usize,
    /// Vector size of the collection's unnamed vector
    pub vector_size: Option<u64>,
    /// Manifest written after the last complete build
    pub manifest: Option<IndexManifest>,
}

impl CollectionState {
    /// Why the collection has to be rebuilt for `manifest`, or `None` if it can be reused
    pub fn stale_reason(&self, manifest: &IndexManifest) -> Option<&'static str> {
        if !self.exists {
            return Some("collection does not exist");
        }
        if self.vector_size != Some(manifest.dimensions as u64) {
            return Some("collection vector size differs from the embedder");
        }
        match &self.manifest {
            None => Some("no record of a completed build"),
            Some(stored) if stored != manifest => {
                Some("collection was built with different settings")
            }
            Some(_) if self.points == 0 => Some("collection is empty"),
            Some(_) => None,
        }
    }
}

/// Vector index living in a Qdrant collection.
///
/// The collection itself has no room for build settings, so the manifest of
/// the last complete build is kept in a file next to the local index.
pub struct QdrantIndex {
    client: Qdrant,
    collection_name: String,
    manifest: IndexManifest,
    manifest_path: PathBuf,
}

impl QdrantIndex {
    /// Create a new Qdrant client for one collection
    pub fn connect(
        config: &QdrantConfig,
        manifest: IndexManifest,
        manifest_dir: &Path,
    ) -> Result<Self> {
        let config_builder = Qdrant::from_url(&config.url);
        let config_builder = if let Some(api_key) = &config.api_key {
            config_builder.api_key(api_key.clone())
        } else {
            config_builder
        };

        let client = config_builder
            .build()
            .with_context(|| format!("Failed to connect to Qdrant at {}", config.url))?;

        let collection_name = get_collection_name(&config.collection);
        let manifest_path = manifest_path(manifest_dir, &collection_name);
        Ok(QdrantIndex {
            client,
            collection_name,
            manifest,
            manifest_path,
        })
    }

    /// Gather everything needed to decide whether the collection can be reused
    pub async fn state(&self) -> Result<CollectionState> {
        let exists = self.collection_exists().await?;
        if !exists {
            return Ok(CollectionState {
                exists,
                points: 0,
                vector_size: None,
                manifest: None,
            });
        }

        Ok(CollectionState {
            exists,
            points: self.count().await?,
            vector_size: self.vector_size().await?,
            manifest: read_manifest(&self.manifest_path),
        })
    }

    async fn vector_size(&self) -> Result<Option<u64>> {
        let info = self
            .client
            .collection_info(self.collection_name.as_str())
            .await
            .with_context(|| format!("Failed to read collection {}", self.collection_name))?;

        Ok(info
            .result
            .and_then(|info| info.config)
            .and_then(|config| config.params)
            .and_then(|params| params.vectors_config)
            .and_then(|vectors| vectors.config)
            .and_then(|config| match config {
                vectors_config::Config::Params(params) => Some(params.size),
                vectors_config::Config::ParamsMap(_) => None,
            }))
    }

    /// Check if the collection exists
    pub async fn collection_exists(&self) -> Result<bool> {
        self.client
            .collection_exists(self.collection_name.as_str())
            .await
            .with_context(|| {
                format!(
                    "Failed to check collection existence: {}",
                    self.collection_name
                )
            })
    }

    /// Drop any existing collection and create an empty one
    pub async fn recreate_collection(&self) -> Result<()> {
        // a build that dies halfway must not look complete on the next start
        remove_manifest(&self.manifest_path)?;

        if self.collection_exists().await? {
            self.client
                .delete_collection(self.collection_name.clone())
                .await
                .with_context(|| {
                    format!("Failed to delete collection {}", self.collection_name)
                })?;
        }

        let create_collection = CreateCollectionBuilder::new(self.collection_name.clone())
            .vectors_config(VectorParams {
                size: self.manifest.dimensions as u64,
                distance: Distance::Cosine.into(),
                ..Default::default()
            });

        self.client
            .create_collection(create_collection)
            .await
            .with_context(|| format!("Failed to create collection {}", self.collection_name))?;

        info!("Created Qdrant collection {}", self.collection_name);
        Ok(())
    }
}

#[async_trait]
impl VectorIndex for QdrantIndex {
    async fn add(&self, entries: Vec<IndexEntry>) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        ensure_first_insert(self.count().await?, &self.collection_name)?;

        let points = entries
            .into_iter()
            .map(|entry| {
                let payload = Payload::try_from(json!({
                    "text": entry.text,
                    "document_id": entry.document_id,
                    "start_position": entry.start_position,
                    "chunk_index": entry.id,
                }))
                .context("Failed to build point payload")?;

                Ok(PointStruct::new(entry.id, entry.vector, payload))
            })
            .collect::<Result<Vec<PointStruct>>>()?;

        for batch in points.chunks(UPSERT_BATCH) {
            let upsert_request =
                UpsertPointsBuilder::new(self.collection_name.clone(), batch.to_vec()).wait(true);

            self.client
                .upsert_points(upsert_request)
                .await
                .with_context(|| {
                    format!(
                        "Failed to upsert points in collection {}",
                        self.collection_name
                    )
                })?;
        }

        info!(
            "Stored {} points in collection {}",
            points.len(),
            self.collection_name
        );
        Ok(())
    }

    async fn count(&self) -> Result<usize> {
        let response = self
            .client
            .count(CountPointsBuilder::new(self.collection_name.clone()).exact(true))
            .await
            .with_context(|| format!("Failed to count collection {}", self.collection_name))?;

        Ok(response.result.map(|r| r.count as usize).unwrap_or(0))
    }

    /// Search for relevant chunks
    async fn query(&self, vector: &[f32], k: usize) -> Result<Vec<ScoredEntry>> {
        if k == 0 {
            return Ok(Vec::new());
        }

        let search_request = SearchPoints {
            collection_name: self.collection_name.clone(),
            vector: vector.to_vec(),
            limit: k as u64,
            with_payload: Some(WithPayloadSelector {
                selector_options: Some(with_payload_selector::SelectorOptions::Enable(true)),
            }),
            ..Default::default()
        };

        let search_response = self
            .client
            .search_points(search_request)
            .await
            .with_context(|| format!("Failed to search collection {}", self.collection_name))?;

        let mut hits: Vec<ScoredEntry> = search_response
            .result
            .into_iter()
            .filter_map(|scored_point| {
                let payload = scored_point.payload;
                let text = payload.get("text")?.as_str()?.to_string();
                let id = payload.get("chunk_index")?.as_integer()? as u64;
                let document_id = payload
                    .get("document_id")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string())
                    .unwrap_or_default();

                Some(ScoredEntry {
                    id,
                    text,
                    document_id,
                    score: scored_point.score,
                })
            })
            .collect();

        // Qdrant does not promise an order among equal scores
        rank(&mut hits);
        Ok(hits)
    }

    /// Record the settings of the completed build
    async fn persist(&self) -> Result<()> {
        write_json_atomic(&self.manifest_path, &self.manifest)?;
        info!(
            "Recorded build settings for collection {} in {}",
            self.collection_name,
            self.manifest_path.display()
        );
        Ok(())
    }
}

/// A collection is filled once per build, like the local index
fn ensure_first_insert(existing_points: usize, collection_name: &str) -> Result<()> {
    if existing_points > 0 {
        bail!(
            "Collection {} already holds {} points; rebuild it instead of adding to it",
            collection_name,
            existing_points
        );
    }
    Ok(())
}

fn manifest_path(dir: &Path, collection_name: &str) -> PathBuf {
    dir.join(format!("{}.manifest.json", collection_name))
}

/// The stored manifest; anything unreadable counts as missing
fn read_manifest(path: &Path) -> Option<IndexManifest> {
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == ErrorKind::NotFound => return None,
        Err(e) => {
            warn!("Failed to read {}: {}", path.display(), e);
            return None;
        }
    };

    match serde_json::from_slice(&raw) {
        Ok(manifest) => Some(manifest),
        Err(e) => {
            warn!("Ignoring corrupt manifest {}: {}", path.display(), e);
            None
        }
    }
}

fn remove_manifest(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Failed to remove {}", path.display())),
    }
}

/// Generate a collection name from a configured name
fn get_collection_name(name: &str) -> String {
    // Replace non-alphanumeric characters with underscores and convert to lowercase
    let name = name
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect::<String>()
        .to_lowercase();

    format!("rag_{}", name)
}
