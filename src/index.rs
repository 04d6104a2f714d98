//! Index Provider: read-only access to a precomputed similarity index.
//!
//! The index is built out-of-band and lives in `<dir>/index.sqlite`:
//!
//! ```sql
//! CREATE TABLE index_meta    (key TEXT PRIMARY KEY, value TEXT NOT NULL);
//! -- required keys: model, metric, dims
//! CREATE TABLE chunks        (id TEXT PRIMARY KEY, chunk_index INTEGER NOT NULL, text TEXT NOT NULL);
//! CREATE TABLE chunk_vectors (chunk_id TEXT PRIMARY KEY, embedding BLOB NOT NULL);
//! ```
//!
//! Embeddings are little-endian `f32` BLOBs (see
//! [`crate::embedding::vec_to_blob`]). The whole index is loaded into
//! memory once per process; queries are brute-force over every chunk.

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::Row;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::OnceCell;

use crate::config::{Config, DistanceMetric};
use crate::embedding::{blob_to_vec, EmbeddingProvider};
use crate::error::{DocentError, Result};
use crate::models::DocumentChunk;

pub const INDEX_FILE: &str = "index.sqlite";

/// Build parameters recorded in `index_meta`.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexMeta {
    pub model: String,
    pub metric: DistanceMetric,
    pub dims: usize,
}

#[derive(Debug)]
pub struct LoadedIndex {
    pub path: PathBuf,
    pub meta: IndexMeta,
    /// Ordered by `chunk_index`.
    pub chunks: Vec<DocumentChunk>,
}

impl LoadedIndex {
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Rejects a query setup that does not match how the index was built.
    /// Similarities computed with another model or metric are meaningless.
    pub fn check_compatible(
        &self,
        metric: DistanceMetric,
        provider: &dyn EmbeddingProvider,
    ) -> Result<()> {
        if self.meta.metric != metric {
            return Err(DocentError::Index(format!(
                "index was built for metric '{}' but index.metric is '{}'",
                self.meta.metric.as_str(),
                metric.as_str()
            )));
        }
        if self.meta.model != provider.model_name() {
            return Err(DocentError::Index(format!(
                "index was built with embedding model '{}' but the configured model is '{}'",
                self.meta.model,
                provider.model_name()
            )));
        }
        if self.meta.dims != provider.dims() {
            return Err(DocentError::Index(format!(
                "index has {} dimensions but the embedding provider produces {}",
                self.meta.dims,
                provider.dims()
            )));
        }
        Ok(())
    }
}

/// Loads `<dir>/index.sqlite` into memory.
///
/// # Errors
///
/// - [`DocentError::MissingResource`] if the directory or file is absent.
/// - [`DocentError::Index`] if the schema or metadata is unreadable, or a
///   vector's length disagrees with the recorded dimensions.
pub async fn load_index(dir: &Path) -> Result<LoadedIndex> {
    let path = dir.join(INDEX_FILE);
    if !path.is_file() {
        return Err(DocentError::missing_index(path));
    }

    let options = SqliteConnectOptions::new()
        .filename(&path)
        .read_only(true)
        .create_if_missing(false);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .map_err(|e| index_error(&path, e))?;

    let result = read_index(&pool, &path).await;
    pool.close().await;
    result
}

async fn read_index(pool: &sqlx::SqlitePool, path: &Path) -> Result<LoadedIndex> {
    let meta_rows = sqlx::query("SELECT key, value FROM index_meta")
        .fetch_all(pool)
        .await
        .map_err(|e| index_error(path, e))?;
    let meta: HashMap<String, String> = meta_rows
        .iter()
        .map(|row| (row.get("key"), row.get("value")))
        .collect();
    let meta = parse_meta(&meta)?;

    let rows = sqlx::query(
        r#"
        SELECT c.id, c.chunk_index, c.text, cv.embedding
        FROM chunks c
        JOIN chunk_vectors cv ON cv.chunk_id = c.id
        ORDER BY c.chunk_index ASC, c.id ASC
        "#,
    )
    .fetch_all(pool)
    .await
    .map_err(|e| index_error(path, e))?;

    let mut chunks = Vec::with_capacity(rows.len());
    for row in &rows {
        let id: String = row.try_get("id").map_err(|e| index_error(path, e))?;
        let blob: Vec<u8> = row.try_get("embedding").map_err(|e| index_error(path, e))?;
        let embedding = blob_to_vec(&blob);
        if embedding.len() != meta.dims {
            return Err(DocentError::Index(format!(
                "chunk {} has {} dimensions, index declares {}",
                id,
                embedding.len(),
                meta.dims
            )));
        }
        if embedding.iter().any(|x| !x.is_finite()) {
            return Err(DocentError::Index(format!(
                "chunk {} has a non-finite embedding component",
                id
            )));
        }
        chunks.push(DocumentChunk {
            id,
            chunk_index: row.try_get("chunk_index").map_err(|e| index_error(path, e))?,
            text: row.try_get("text").map_err(|e| index_error(path, e))?,
            embedding,
        });
    }

    tracing::info!(
        path = %path.display(),
        chunks = chunks.len(),
        model = %meta.model,
        metric = meta.metric.as_str(),
        dims = meta.dims,
        "index loaded"
    );

    Ok(LoadedIndex {
        path: path.to_path_buf(),
        meta,
        chunks,
    })
}

fn parse_meta(meta: &HashMap<String, String>) -> Result<IndexMeta> {
    let get = |key: &str| {
        meta.get(key)
            .map(|v| v.trim().to_string())
            .ok_or_else(|| DocentError::Index(format!("index_meta is missing '{}'", key)))
    };

    let model = get("model")?;
    let metric_str = get("metric")?;
    let metric = DistanceMetric::parse(&metric_str)
        .ok_or_else(|| DocentError::Index(format!("unknown index metric '{}'", metric_str)))?;
    let dims_str = get("dims")?;
    let dims = dims_str
        .parse::<usize>()
        .ok()
        .filter(|d| *d > 0)
        .ok_or_else(|| DocentError::Index(format!("invalid index dims '{}'", dims_str)))?;

    Ok(IndexMeta {
        model,
        metric,
        dims,
    })
}

fn index_error(path: &Path, err: sqlx::Error) -> DocentError {
    DocentError::Index(format!("{}: {}", path.display(), err))
}

/// Process-wide, lazily loaded index.
///
/// The first successful load is kept for the life of the process; a failed
/// load is not cached, so a later turn retries once the index appears.
pub struct IndexProvider {
    dir: PathBuf,
    loaded: OnceCell<Arc<LoadedIndex>>,
}

impl IndexProvider {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            loaded: OnceCell::new(),
        }
    }

    pub async fn get(&self) -> Result<Arc<LoadedIndex>> {
        let index = self
            .loaded
            .get_or_try_init(|| async { load_index(&self.dir).await.map(Arc::new) })
            .await?;
        Ok(index.clone())
    }
}

/// `docent index info`: prints the index metadata and chunk count.
pub async fn run_index_info(config: &Config) -> anyhow::Result<()> {
    let index = load_index(&config.index.dir).await?;

    println!("path:    {}", index.path.display());
    println!("model:   {}", index.meta.model);
    println!("metric:  {}", index.meta.metric.as_str());
    println!("dims:    {}", index.meta.dims);
    println!("chunks:  {}", index.len());

    if index.meta.metric != config.index.metric {
        println!(
            "warning: config index.metric is '{}', queries will be rejected",
            config.index.metric.as_str()
        );
    }

    Ok(())
}
