//! Core data models used throughout docent.
//!
//! These types represent the messages, chunks, and prompt contexts that
//! flow through a chat turn.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One entry of a conversation. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            created_at: Utc::now(),
        }
    }
}

/// A chunk of the source document with its embedding, as stored in a
/// precomputed index. Never created or mutated by docent.
#[derive(Debug, Clone)]
pub struct DocumentChunk {
    pub id: String,
    pub chunk_index: i64,
    pub text: String,
    pub embedding: Vec<f32>,
}

/// A chunk returned by the retriever. Higher `score` means more similar,
/// whatever the metric.
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub chunk: DocumentChunk,
    pub score: f32,
}

/// The variable part of the system instruction, rebuilt for every request.
#[derive(Debug, Clone)]
pub enum PromptContext {
    FullText(Arc<str>),
    Retrieved(Vec<ScoredChunk>),
}

impl PromptContext {
    /// True when there is nothing to ground an answer on.
    pub fn is_empty(&self) -> bool {
        match self {
            PromptContext::FullText(text) => text.trim().is_empty(),
            PromptContext::Retrieved(chunks) => {
                chunks.iter().all(|c| c.chunk.text.trim().is_empty())
            }
        }
    }
}
