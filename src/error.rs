//! Error taxonomy for a chat turn.
//!
//! Every failure a user can see maps to one [`DocentError`] variant. Each
//! variant carries a stable machine-readable [`code`](DocentError::code),
//! used by the HTTP error body and SSE `error` events, and a `Display`
//! message meant to be shown to the user as-is.
//!
//! Provider plumbing works in `anyhow` and is converted at the boundary
//! of a turn (see [`crate::session`]).

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Which on-disk resource a [`DocentError::MissingResource`] refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Document,
    Index,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Document => write!(f, "document"),
            ResourceKind::Index => write!(f, "index"),
        }
    }
}

#[derive(Error, Debug)]
pub enum DocentError {
    /// Source document or index not found on disk.
    #[error("{kind} not found: {}", path.display())]
    MissingResource { kind: ResourceKind, path: PathBuf },

    /// Document present but unparsable, or without any text.
    #[error("could not extract text from document: {0}")]
    Extraction(String),

    /// Index present but unreadable or incompatible with the configuration.
    #[error("index error: {0}")]
    Index(String),

    /// Query embedding failed.
    #[error("embedding failed: {0}")]
    Embedding(String),

    /// The hosted generation call failed or returned nothing usable.
    #[error("answer generation failed: {0}")]
    Generation(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl DocentError {
    pub fn missing_document(path: impl Into<PathBuf>) -> Self {
        DocentError::MissingResource {
            kind: ResourceKind::Document,
            path: path.into(),
        }
    }

    pub fn missing_index(path: impl Into<PathBuf>) -> Self {
        DocentError::MissingResource {
            kind: ResourceKind::Index,
            path: path.into(),
        }
    }

    /// Wraps a provider error, keeping the whole `anyhow` context chain.
    pub fn generation(err: anyhow::Error) -> Self {
        DocentError::Generation(format!("{:#}", err))
    }

    pub fn embedding(err: anyhow::Error) -> Self {
        DocentError::Embedding(format!("{:#}", err))
    }

    /// Stable error code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            DocentError::MissingResource { .. } => "missing_resource",
            DocentError::Extraction(_) => "extraction_failure",
            DocentError::Index(_) => "index_error",
            DocentError::Embedding(_) => "embedding_failure",
            DocentError::Generation(_) => "generation_failure",
            DocentError::InvalidInput(_) => "bad_request",
            DocentError::Other(_) => "internal",
        }
    }
}

pub type Result<T> = std::result::Result<T, DocentError>;
