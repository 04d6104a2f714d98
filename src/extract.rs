//! Document Loader: PDF text extraction with a per-document cache.
//!
//! A document comes either from a fixed path on disk or from a user
//! upload. Extraction yields the text of every page concatenated in page
//! order. Results are memoized by document identity, so repeated turns of
//! a conversation never re-parse the same PDF:
//!
//! | Source | Identity |
//! |--------|----------|
//! | [`DocumentSource::File`] | canonical path + modification time + length |
//! | [`DocumentSource::Upload`] | SHA-256 of the bytes |
//!
//! Concurrent first loads of the same document share one parse. A failed
//! parse is not cached, so the next load tries again.
//!
//! Entries are never evicted. A file rewritten in place gets a new
//! identity through its mtime/length; one rewritten with identical mtime
//! and length keeps serving the old text until the process restarts.
//!
//! Parsing runs on the blocking pool, so a parser that panics on a
//! malformed PDF surfaces as [`DocentError::Extraction`] instead of taking
//! the process down.

use anyhow::anyhow;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;
use tokio::sync::OnceCell;

use crate::error::{DocentError, Result};

/// Splits a PDF into per-page text.
///
/// The seam exists so the cache can be exercised without a real parser.
pub trait PageExtractor: Send + Sync {
    fn extract_pages(&self, bytes: &[u8]) -> anyhow::Result<Vec<String>>;
}

/// [`PageExtractor`] backed by `pdf-extract`.
pub struct PdfExtractor;

impl PageExtractor for PdfExtractor {
    fn extract_pages(&self, bytes: &[u8]) -> anyhow::Result<Vec<String>> {
        pdf_extract::extract_text_from_mem_by_pages(bytes)
            .map_err(|e| anyhow!("PDF extraction failed: {}", e))
    }
}

/// Where a document's bytes come from.
#[derive(Debug, Clone)]
pub enum DocumentSource {
    /// A path, resolved against the working directory when relative.
    File(PathBuf),
    /// Bytes supplied by the user at runtime.
    Upload { name: String, bytes: Arc<[u8]> },
}

impl DocumentSource {
    pub fn upload(name: impl Into<String>, bytes: impl Into<Arc<[u8]>>) -> Self {
        DocumentSource::Upload {
            name: name.into(),
            bytes: bytes.into(),
        }
    }

    pub fn display_name(&self) -> String {
        match self {
            DocumentSource::File(path) => path.display().to_string(),
            DocumentSource::Upload { name, .. } => name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum DocumentKey {
    File {
        path: PathBuf,
        modified: Option<SystemTime>,
        len: u64,
    },
    Upload(String),
}

/// Extracts document text and memoizes it for the process lifetime.
pub struct DocumentLoader {
    extractor: Arc<dyn PageExtractor>,
    cache: Mutex<HashMap<DocumentKey, Arc<OnceCell<Arc<str>>>>>,
}

impl Default for DocumentLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl DocumentLoader {
    pub fn new() -> Self {
        Self::with_extractor(Arc::new(PdfExtractor))
    }

    pub fn with_extractor(extractor: Arc<dyn PageExtractor>) -> Self {
        Self {
            extractor,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Number of documents currently cached.
    pub fn cached_documents(&self) -> usize {
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|cell| cell.initialized())
            .count()
    }

    /// Returns the full text of `source`, parsing it on first use only.
    ///
    /// # Errors
    ///
    /// - [`DocentError::MissingResource`] if a file source does not exist.
    /// - [`DocentError::Extraction`] if the document is empty, cannot be
    ///   parsed, or contains no text.
    pub async fn load(&self, source: &DocumentSource) -> Result<Arc<str>> {
        let key = identify(source).await?;
        let cell = self.slot(key);

        if let Some(text) = cell.get() {
            tracing::debug!(document = %source.display_name(), "document cache hit");
            return Ok(text.clone());
        }

        let text = cell.get_or_try_init(|| self.extract(source)).await?;
        Ok(text.clone())
    }

    fn slot(&self, key: DocumentKey) -> Arc<OnceCell<Arc<str>>> {
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(key)
            .or_default()
            .clone()
    }

    async fn extract(&self, source: &DocumentSource) -> Result<Arc<str>> {
        let bytes: Arc<[u8]> = match source {
            DocumentSource::File(path) => tokio::fs::read(path)
                .await
                .map_err(|e| read_error(path, e))?
                .into(),
            DocumentSource::Upload { bytes, .. } => bytes.clone(),
        };
        if bytes.is_empty() {
            return Err(DocentError::Extraction("document is empty".to_string()));
        }

        tracing::info!(
            document = %source.display_name(),
            bytes = bytes.len(),
            "extracting document text"
        );

        let extractor = self.extractor.clone();
        let pages = tokio::task::spawn_blocking(move || extractor.extract_pages(&bytes))
            .await
            .map_err(|e| DocentError::Extraction(format!("PDF parser aborted: {}", e)))?
            .map_err(|e| DocentError::Extraction(format!("{:#}", e)))?;

        let text = pages.concat();
        if text.trim().is_empty() {
            return Err(DocentError::Extraction(format!(
                "no extractable text in {} page(s)",
                pages.len()
            )));
        }

        tracing::info!(pages = pages.len(), chars = text.chars().count(), "document ready");
        Ok(Arc::from(text))
    }
}

async fn identify(source: &DocumentSource) -> Result<DocumentKey> {
    match source {
        DocumentSource::File(path) => {
            let meta = tokio::fs::metadata(path)
                .await
                .map_err(|e| read_error(path, e))?;
            if !meta.is_file() {
                return Err(DocentError::missing_document(path));
            }
            let canonical = tokio::fs::canonicalize(path)
                .await
                .unwrap_or_else(|_| path.to_path_buf());
            Ok(DocumentKey::File {
                path: canonical,
                modified: meta.modified().ok(),
                len: meta.len(),
            })
        }
        DocumentSource::Upload { bytes, .. } => {
            Ok(DocumentKey::Upload(hex::encode(Sha256::digest(&bytes[..]))))
        }
    }
}

fn read_error(path: &Path, err: std::io::Error) -> DocentError {
    if err.kind() == std::io::ErrorKind::NotFound {
        DocentError::missing_document(path)
    } else {
        DocentError::Other(anyhow!(err).context(format!("Failed to read {}", path.display())))
    }
}
