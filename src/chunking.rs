use crate::document::Document;
use anyhow::{bail, Result};

/// Sliding-window parameters, measured in characters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkingConfig {
    pub size: usize,
    pub overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        ChunkingConfig {
            size: 500,
            overlap: 100,
        }
    }
}

impl ChunkingConfig {
    /// Validate a window; the stride `size - overlap` must be positive
    pub fn new(size: usize, overlap: usize) -> Result<Self> {
        if size == 0 {
            bail!("chunk size must be positive");
        }
        if overlap >= size {
            bail!(
                "chunk overlap ({}) must be smaller than chunk size ({})",
                overlap,
                size
            );
        }
        Ok(ChunkingConfig { size, overlap })
    }

    pub fn stride(&self) -> usize {
        self.size - self.overlap
    }
}

/// Represents a text chunk with metadata
#[derive(Debug, Clone, PartialEq)]
pub struct TextChunk {
    /// The actual text content of this chunk
    pub text: String,
    /// Identifier of the document this chunk belongs to
    pub document_id: String,
    /// Starting position of this chunk in the original document, in characters
    pub start_position: usize,
}

/// Split text into overlapping windows of `size` characters
pub fn chunk_text(text: &str, size: usize, overlap: usize) -> Result<Vec<String>> {
    let config = ChunkingConfig::new(size, overlap)?;
    Ok(windows(text, &config)
        .into_iter()
        .map(|(_, chunk)| chunk.to_string())
        .collect())
}

/// Split a document into chunks that remember where they came from
pub fn split_document(document: &Document, config: &ChunkingConfig) -> Vec<TextChunk> {
    windows(&document.content, config)
        .into_iter()
        .map(|(start_position, text)| TextChunk {
            text: text.to_string(),
            document_id: document.document_id.clone(),
            start_position,
        })
        .collect()
}

/// Windows start every `stride` characters until the start reaches the end of the text
fn windows<'a>(text: &'a str, config: &ChunkingConfig) -> Vec<(usize, &'a str)> {
    // byte offset of every character, so windows never split a code point
    let offsets: Vec<usize> = text.char_indices().map(|(i, _)| i).collect();
    let length = offsets.len();
    let byte_at = |pos: usize| offsets.get(pos).copied().unwrap_or(text.len());

    let mut chunks = Vec::with_capacity(length / config.stride() + 1);
    let mut start = 0;
    while start < length {
        let end = (start + config.size).min(length);
        chunks.push((start, &text[byte_at(start)..byte_at(end)]));
        start += config.stride();
    }
    chunks
}
