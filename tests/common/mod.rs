//! Stubs and fixtures shared by the library-level integration tests.

#![allow(dead_code)]

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use docent::config::Config;
use docent::embedding::{vec_to_blob, EmbeddingProvider};
use docent::extract::{DocumentLoader, PageExtractor};
use docent::generation::{AnswerStream, GenerationRequest, Generator};
use docent::session::ChatServices;

/// What a [`StubGenerator`] does on every call.
#[derive(Clone)]
pub enum Script {
    /// Answer with these fragments (joined for single-shot calls).
    Answer(Vec<String>),
    /// Fail before producing anything.
    Fail(String),
    /// Stream these fragments, then stop without a completion signal.
    Truncate(Vec<String>),
}

pub struct StubGenerator {
    script: Script,
    calls: AtomicUsize,
    last_request: Mutex<Option<GenerationRequest>>,
}

impl StubGenerator {
    pub fn new(script: Script) -> Arc<Self> {
        Arc::new(Self {
            script,
            calls: AtomicUsize::new(0),
            last_request: Mutex::new(None),
        })
    }

    pub fn answering(fragments: &[&str]) -> Arc<Self> {
        Self::new(Script::Answer(
            fragments.iter().map(|f| f.to_string()).collect(),
        ))
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_request(&self) -> Option<GenerationRequest> {
        self.last_request.lock().unwrap().clone()
    }

    fn record(&self, request: &GenerationRequest) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_request.lock().unwrap() = Some(request.clone());
    }
}

#[async_trait]
impl Generator for StubGenerator {
    fn model_name(&self) -> &str {
        "stub"
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<String> {
        self.record(request);
        match &self.script {
            Script::Answer(fragments) => Ok(fragments.concat()),
            Script::Fail(message) => Err(anyhow!("{}", message)),
            Script::Truncate(_) => bail!("connection reset"),
        }
    }

    async fn stream(&self, request: &GenerationRequest) -> Result<AnswerStream> {
        self.record(request);
        match &self.script {
            Script::Answer(fragments) => Ok(AnswerStream::from_fragments(fragments.clone())),
            Script::Fail(message) => Err(anyhow!("{}", message)),
            Script::Truncate(fragments) => {
                let (tx, stream) = AnswerStream::channel();
                let fragments = fragments.clone();
                tokio::spawn(async move {
                    for fragment in fragments {
                        tx.fragment(fragment).await;
                    }
                    // tx dropped without finish()
                });
                Ok(stream)
            }
        }
    }
}

/// Reads the bytes as UTF-8 with pages separated by form feeds, counting
/// how often it is invoked.
#[derive(Default)]
pub struct PagesExtractor {
    calls: AtomicUsize,
}

impl PagesExtractor {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl PageExtractor for PagesExtractor {
    fn extract_pages(&self, bytes: &[u8]) -> Result<Vec<String>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let text = std::str::from_utf8(bytes)?;
        Ok(text.split('\x0c').map(str::to_string).collect())
    }
}

/// Embeds by looking the text up in a fixed table; unknown text gets the
/// first basis vector.
pub struct TableEmbedder {
    pub model: String,
    pub dims: usize,
    pub table: Vec<(String, Vec<f32>)>,
}

#[async_trait]
impl EmbeddingProvider for TableEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|text| {
                self.table
                    .iter()
                    .find(|(key, _)| key == text)
                    .map(|(_, v)| v.clone())
                    .unwrap_or_else(|| {
                        let mut v = vec![0.0; self.dims];
                        v[0] = 1.0;
                        v
                    })
            })
            .collect())
    }
}

/// Writes a document file whose pages are separated by form feeds.
pub fn write_document(dir: &Path, name: &str, pages: &[&str]) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, pages.join("\x0c")).unwrap();
    path
}

/// Full-text services over `document` with a stub generator and the
/// form-feed extractor.
pub fn full_text_services(
    document: &Path,
    generator: Arc<StubGenerator>,
    extractor: Arc<PagesExtractor>,
) -> Arc<ChatServices> {
    full_text_services_with(document, generator, extractor, |_| {})
}

/// Like [`full_text_services`], with a hook to adjust the configuration.
pub fn full_text_services_with(
    document: &Path,
    generator: Arc<StubGenerator>,
    extractor: Arc<PagesExtractor>,
    configure: impl FnOnce(&mut Config),
) -> Arc<ChatServices> {
    let mut config = Config::default();
    config.document.path = document.to_path_buf();
    configure(&mut config);
    let services = ChatServices::new(config, generator, None)
        .unwrap()
        .with_loader(DocumentLoader::with_extractor(extractor));
    Arc::new(services)
}

/// Creates `<dir>/index.sqlite` with the given metadata and chunks.
pub async fn write_index(dir: &Path, model: &str, metric: &str, chunks: &[(&str, Vec<f32>)]) {
    std::fs::create_dir_all(dir).unwrap();
    let dims = chunks.first().map(|(_, v)| v.len()).unwrap_or(2);
    let options = SqliteConnectOptions::new()
        .filename(dir.join(docent::index::INDEX_FILE))
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .unwrap();

    for ddl in [
        "CREATE TABLE index_meta (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
        "CREATE TABLE chunks (id TEXT PRIMARY KEY, chunk_index INTEGER NOT NULL, text TEXT NOT NULL)",
        "CREATE TABLE chunk_vectors (chunk_id TEXT PRIMARY KEY, embedding BLOB NOT NULL)",
    ] {
        sqlx::query(ddl).execute(&pool).await.unwrap();
    }
    for (key, value) in [
        ("model", model.to_string()),
        ("metric", metric.to_string()),
        ("dims", dims.to_string()),
    ] {
        sqlx::query("INSERT INTO index_meta (key, value) VALUES (?, ?)")
            .bind(key)
            .bind(value)
            .execute(&pool)
            .await
            .unwrap();
    }
    for (i, (text, vector)) in chunks.iter().enumerate() {
        let id = format!("chunk-{}", i);
        sqlx::query("INSERT INTO chunks (id, chunk_index, text) VALUES (?, ?, ?)")
            .bind(&id)
            .bind(i as i64)
            .bind(*text)
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO chunk_vectors (chunk_id, embedding) VALUES (?, ?)")
            .bind(&id)
            .bind(vec_to_blob(vector))
            .execute(&pool)
            .await
            .unwrap();
    }
    pool.close().await;
}
