//! Retriever: top-k nearest chunks for a query.
//!
//! Embeds the query with the configured provider and scores it against
//! every chunk of the [`LoadedIndex`]. No approximate search: indexes for a
//! single manual are small enough that a linear scan is the whole story.

use std::sync::Arc;

use crate::config::DistanceMetric;
use crate::embedding::{self, EmbeddingProvider};
use crate::error::{DocentError, Result};
use crate::index::LoadedIndex;
use crate::models::{DocumentChunk, ScoredChunk};

/// Similarity under `metric`; higher is always more similar.
/// L2 is negated so that the nearest chunk scores highest.
pub fn similarity(metric: DistanceMetric, a: &[f32], b: &[f32]) -> f32 {
    match metric {
        DistanceMetric::Cosine => embedding::cosine_similarity(a, b),
        DistanceMetric::Dot => embedding::dot_product(a, b),
        DistanceMetric::L2 => -embedding::l2_distance(a, b),
    }
}

/// Returns the `min(k, chunks.len())` chunks most similar to `query`,
/// best first. Equal scores keep index order; a non-finite score ranks
/// last.
pub fn top_k(
    chunks: &[DocumentChunk],
    query: &[f32],
    metric: DistanceMetric,
    k: usize,
) -> Vec<ScoredChunk> {
    let mut scored: Vec<ScoredChunk> = chunks
        .iter()
        .map(|chunk| {
            let score = similarity(metric, query, &chunk.embedding);
            ScoredChunk {
                score: if score.is_nan() { f32::NEG_INFINITY } else { score },
                chunk: chunk.clone(),
            }
        })
        .collect();

    scored.sort_by(|a, b| b.score.total_cmp(&a.score));
    scored.truncate(k);
    scored
}

pub struct Retriever {
    provider: Arc<dyn EmbeddingProvider>,
    metric: DistanceMetric,
    default_k: usize,
}

impl Retriever {
    pub fn new(
        provider: Arc<dyn EmbeddingProvider>,
        metric: DistanceMetric,
        default_k: usize,
    ) -> Self {
        Self {
            provider,
            metric,
            default_k,
        }
    }

    /// Embeds `query` and returns its nearest chunks; `k` overrides the
    /// configured default.
    ///
    /// # Errors
    ///
    /// - [`DocentError::Index`] if the index was built with another model,
    ///   metric, or dimensionality.
    /// - [`DocentError::Embedding`] if the provider fails or returns a
    ///   vector of the wrong length.
    pub async fn retrieve(
        &self,
        index: &LoadedIndex,
        query: &str,
        k: Option<usize>,
    ) -> Result<Vec<ScoredChunk>> {
        index.check_compatible(self.metric, self.provider.as_ref())?;

        let query_vec = embedding::embed_query(self.provider.as_ref(), query)
            .await
            .map_err(DocentError::embedding)?;
        if query_vec.len() != index.meta.dims {
            return Err(DocentError::Embedding(format!(
                "query embedding has {} dimensions, index expects {}",
                query_vec.len(),
                index.meta.dims
            )));
        }

        let k = k.unwrap_or(self.default_k);
        let results = top_k(&index.chunks, &query_vec, self.metric, k);
        tracing::debug!(
            k,
            returned = results.len(),
            best = results.first().map(|r| r.score),
            "retrieved chunks"
        );
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(i: i64, v: Vec<f32>) -> DocumentChunk {
        DocumentChunk {
            id: format!("c{}", i),
            chunk_index: i,
            text: format!("chunk {}", i),
            embedding: v,
        }
    }

    fn ids(results: &[ScoredChunk]) -> Vec<&str> {
        results.iter().map(|r| r.chunk.id.as_str()).collect()
    }

    #[test]
    fn returns_the_k_most_similar_best_first() {
        let chunks = vec![
            chunk(0, vec![0.0, 1.0]),
            chunk(1, vec![1.0, 0.1]),
            chunk(2, vec![-1.0, 0.0]),
            chunk(3, vec![1.0, 0.5]),
            chunk(4, vec![0.7, 0.7]),
            chunk(5, vec![1.0, 0.0]),
        ];
        let results = top_k(&chunks, &[1.0, 0.0], DistanceMetric::Cosine, 4);
        assert_eq!(ids(&results), vec!["c5", "c1", "c3", "c4"]);
    }

    #[test]
    fn fewer_chunks_than_k_returns_all() {
        let chunks = vec![chunk(0, vec![1.0]), chunk(1, vec![2.0])];
        let results = top_k(&chunks, &[1.0], DistanceMetric::Dot, 4);
        assert_eq!(results.len(), 2);
        assert_eq!(ids(&results), vec!["c1", "c0"]);
    }

    #[test]
    fn l2_prefers_the_nearest_point() {
        let chunks = vec![
            chunk(0, vec![10.0, 10.0]),
            chunk(1, vec![1.0, 1.0]),
            chunk(2, vec![2.0, 2.0]),
        ];
        let results = top_k(&chunks, &[1.5, 1.4], DistanceMetric::L2, 1);
        assert_eq!(ids(&results), vec!["c1"]);
        assert!(results[0].score <= 0.0);
    }

    #[test]
    fn nan_scores_rank_last_without_panicking() {
        let chunks: Vec<DocumentChunk> = (0..64)
            .map(|i| {
                if i % 3 == 0 {
                    chunk(i, vec![f32::NAN, 1.0])
                } else {
                    chunk(i, vec![1.0, i as f32 / 64.0])
                }
            })
            .collect();
        let results = top_k(&chunks, &[1.0, 0.0], DistanceMetric::Cosine, 4);
        assert_eq!(results.len(), 4);
        assert!(results.iter().all(|r| r.score.is_finite()));
        assert_eq!(results[0].chunk.id, "c1");

        let all = top_k(&chunks, &[1.0, 0.0], DistanceMetric::Cosine, 64);
        assert_eq!(all.last().unwrap().score, f32::NEG_INFINITY);
    }

    #[test]
    fn ties_keep_index_order() {
        let chunks = vec![chunk(0, vec![1.0]), chunk(1, vec![1.0]), chunk(2, vec![1.0])];
        let results = top_k(&chunks, &[1.0], DistanceMetric::Cosine, 2);
        assert_eq!(ids(&results), vec!["c0", "c1"]);
    }
}
