use anyhow::{anyhow, Context, Result};
use log::{debug, info, warn};
use pdf_extract::extract_text_by_pages;
use std::fs;
use std::io::ErrorKind;
use std::panic;
use std::path::{Path, PathBuf};

/// Represents a document with its content and origin
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    /// The actual text content of the document
    pub content: String,
    /// The document's file name, with a page suffix for PDF pages
    pub document_id: String,
}

/// Source formats the loader understands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    PlainText,
    Pdf,
}

impl DocumentKind {
    /// Detect the format from the file extension; `None` means the file is ignored
    pub fn from_path(path: &Path) -> Option<Self> {
        let extension = path.extension()?.to_str()?.to_lowercase();
        match extension.as_str() {
            "txt" => Some(DocumentKind::PlainText),
            "pdf" => Some(DocumentKind::Pdf),
            _ => None,
        }
    }
}

/// Load every supported document in a directory.
///
/// Ingestion is best-effort: a missing directory gives an empty corpus, and
/// files or pages that cannot be read are skipped with a warning.
pub fn load_documents<P: AsRef<Path>>(dir: P) -> Vec<Document> {
    let dir = dir.as_ref();

    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            info!("Knowledge base directory {} does not exist", dir.display());
            return Vec::new();
        }
        Err(e) => {
            warn!("Failed to list knowledge base {}: {}", dir.display(), e);
            return Vec::new();
        }
    };

    // Sorted so chunk ids come out the same on every build
    let mut paths: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .collect();
    paths.sort();

    let mut documents = Vec::new();
    for path in paths {
        let Some(kind) = DocumentKind::from_path(&path) else {
            debug!("Skipping unsupported file: {}", path.display());
            continue;
        };

        match read_documents(&path, kind) {
            Ok(mut docs) => documents.append(&mut docs),
            Err(e) => warn!("Skipping {}: {:#}", path.display(), e),
        }
    }

    info!("Loaded {} documents from {}", documents.len(), dir.display());
    documents
}

/// Read one file into one or more documents
pub fn read_documents(path: &Path, kind: DocumentKind) -> Result<Vec<Document>> {
    let file_name = path
        .file_name()
        .context("Invalid file name")?
        .to_string_lossy()
        .to_string();

    match kind {
        DocumentKind::PlainText => {
            debug!("Processing text document: {}", path.display());
            let bytes = fs::read(path)
                .with_context(|| format!("Failed to read text file: {}", path.display()))?;
            let content = String::from_utf8_lossy(&bytes).into_owned();

            if content.trim().is_empty() {
                return Ok(Vec::new());
            }
            Ok(vec![Document {
                content,
                document_id: file_name,
            }])
        }

        DocumentKind::Pdf => {
            debug!("Processing PDF document: {}", path.display());
            // pdf-extract panics on some malformed files
            let pages = panic::catch_unwind(|| extract_text_by_pages(path))
                .map_err(|_| anyhow!("PDF parser panicked on {}", path.display()))?
                .with_context(|| format!("Failed to extract text from PDF: {}", path.display()))?;

            Ok(pages
                .iter()
                .enumerate()
                .filter_map(|(idx, page)| {
                    // PDF extraction can sometimes include excessive whitespace
                    let content = normalize_whitespace(page);
                    if content.is_empty() {
                        return None;
                    }
                    Some(Document {
                        content,
                        document_id: format!("{}#page{}", file_name, idx + 1),
                    })
                })
                .collect())
        }
    }
}

/// Normalize whitespace in text (remove multiple consecutive spaces, newlines, etc.)
fn normalize_whitespace(text: &str) -> String {
    let result = text.replace('\r', "");

    let mut prev_char = ' ';
    let mut newline_count = 0;
    let mut normalized = String::with_capacity(result.len());

    for c in result.chars() {
        if c == '\n' {
            newline_count += 1;
            continue;
        }

        if newline_count > 0 {
            normalized.push_str(if newline_count >= 2 { "\n\n" } else { "\n" });
            newline_count = 0;
        }

        if !(c == ' ' && prev_char == ' ') {
            normalized.push(c);
        }
        prev_char = c;
    }

    normalized.trim().to_string()
}
