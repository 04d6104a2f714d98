//! TOML configuration.
//!
//! Every section is optional; a missing config file yields
//! [`Config::default`], which answers from `manual.pdf` in the working
//! directory with Gemini in streaming full-text mode.
//!
//! ```toml
//! [document]
//! path = "manual.pdf"
//!
//! [context]
//! mode = "retrieval"          # or "full_text"
//!
//! [index]
//! dir = "faiss_index"
//! top_k = 4
//! metric = "cosine"           # cosine | dot | l2
//!
//! [embedding]
//! provider = "gemini"
//! model = "text-embedding-004"
//! dims = 768
//!
//! [generation]
//! provider = "gemini"
//! model = "gemini-2.5-flash"
//! temperature = 0.2
//!
//! [secrets]
//! file = ".streamlit/secrets.toml"
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub document: DocumentConfig,
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub prompt: PromptConfig,
    #[serde(default)]
    pub postprocess: PostprocessConfig,
    #[serde(default)]
    pub secrets: SecretsConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DocumentConfig {
    /// Resolved relative to the working directory.
    #[serde(default = "default_document_path")]
    pub path: PathBuf,
}

impl Default for DocumentConfig {
    fn default() -> Self {
        Self {
            path: default_document_path(),
        }
    }
}

fn default_document_path() -> PathBuf {
    PathBuf::from("manual.pdf")
}

/// Where the prompt context comes from.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ContextMode {
    /// The whole extracted document text.
    #[default]
    FullText,
    /// The top-k chunks of a precomputed index.
    Retrieval,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ContextConfig {
    #[serde(default)]
    pub mode: ContextMode,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DistanceMetric {
    #[default]
    Cosine,
    Dot,
    L2,
}

impl DistanceMetric {
    pub fn as_str(&self) -> &'static str {
        match self {
            DistanceMetric::Cosine => "cosine",
            DistanceMetric::Dot => "dot",
            DistanceMetric::L2 => "l2",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cosine" => Some(DistanceMetric::Cosine),
            "dot" | "ip" | "inner_product" => Some(DistanceMetric::Dot),
            "l2" | "euclidean" => Some(DistanceMetric::L2),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    #[serde(default = "default_index_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Must match the metric recorded in the index.
    #[serde(default)]
    pub metric: DistanceMetric,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            dir: default_index_dir(),
            top_k: default_top_k(),
            metric: DistanceMetric::default(),
        }
    }
}

fn default_index_dir() -> PathBuf {
    PathBuf::from("faiss_index")
}
fn default_top_k() -> usize {
    4
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL override (Ollama, OpenAI-compatible gateways, Gemini proxies).
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_embedding_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_embedding_timeout_secs(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_embedding_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    3
}
fn default_embedding_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    #[serde(default = "default_generation_provider")]
    pub provider: String,
    #[serde(default = "default_generation_model")]
    pub model: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub top_k: Option<u32>,
    /// Stream answers fragment by fragment (with post-processing) instead
    /// of returning one complete answer.
    #[serde(default = "default_stream")]
    pub stream: bool,
    #[serde(default = "default_generation_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: default_generation_provider(),
            model: default_generation_model(),
            base_url: None,
            temperature: None,
            top_p: None,
            top_k: None,
            stream: default_stream(),
            timeout_secs: default_generation_timeout_secs(),
        }
    }
}

fn default_generation_provider() -> String {
    "gemini".to_string()
}
fn default_generation_model() -> String {
    "gemini-2.5-flash".to_string()
}
fn default_stream() -> bool {
    true
}
fn default_generation_timeout_secs() -> u64 {
    120
}

#[derive(Debug, Deserialize, Clone)]
pub struct PromptConfig {
    #[serde(default = "default_persona")]
    pub persona: String,
    /// Sentence the model must answer with when the context has no answer.
    #[serde(default = "default_refusal")]
    pub refusal: String,
    /// Prefix for bare 4-digit phone extensions, e.g. `053-667`.
    #[serde(default = "default_office_code")]
    pub office_code: String,
    #[serde(default)]
    pub extra_rules: Vec<String>,
    /// Seeded as the first assistant message of a new session.
    #[serde(default)]
    pub welcome: Option<String>,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            persona: default_persona(),
            refusal: default_refusal(),
            office_code: default_office_code(),
            extra_rules: Vec::new(),
            welcome: None,
        }
    }
}

fn default_persona() -> String {
    "당신은 대구광역시 달서구의 사회복지업무 전문가입니다.".to_string()
}
fn default_refusal() -> String {
    "죄송합니다. 정보가 없어 답변을 할 수 없습니다.".to_string()
}
fn default_office_code() -> String {
    "053-667".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct PostprocessConfig {
    /// Prefix flagged 4-digit extensions in streamed fragments with
    /// `prompt.office_code`.
    #[serde(default = "default_phone_prefix")]
    pub phone_prefix: bool,
}

impl Default for PostprocessConfig {
    fn default() -> Self {
        Self {
            phone_prefix: default_phone_prefix(),
        }
    }
}

fn default_phone_prefix() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct SecretsConfig {
    /// Optional TOML secrets file; checked before the environment.
    #[serde(default)]
    pub file: Option<PathBuf>,
    /// Key inside the secrets file, and environment variable name.
    #[serde(default = "default_key_name")]
    pub key_name: String,
}

impl Default for SecretsConfig {
    fn default() -> Self {
        Self {
            file: None,
            key_name: default_key_name(),
        }
    }
}

fn default_key_name() -> String {
    "GOOGLE_API_KEY".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
    /// Sessions untouched for this long are dropped; 0 keeps them forever.
    #[serde(default = "default_session_idle_secs")]
    pub session_idle_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            max_upload_bytes: default_max_upload_bytes(),
            session_idle_secs: default_session_idle_secs(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8501".to_string()
}
fn default_max_upload_bytes() -> usize {
    50 * 1024 * 1024
}
fn default_session_idle_secs() -> u64 {
    3600
}

/// Loads and validates a config file.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

/// Like [`load_config`], but falls back to [`Config::default`] when the
/// file does not exist.
pub fn load_config_or_default(path: &Path) -> Result<Config> {
    if path.exists() {
        load_config(path)
    } else {
        tracing::debug!(path = %path.display(), "config file not found, using defaults");
        Ok(Config::default())
    }
}

pub fn validate(config: &Config) -> Result<()> {
    if config.index.top_k == 0 {
        bail!("index.top_k must be >= 1");
    }

    if let Some(t) = config.generation.temperature {
        if !(0.0..=2.0).contains(&t) {
            bail!("generation.temperature must be in [0.0, 2.0]");
        }
    }
    if let Some(p) = config.generation.top_p {
        if !(p > 0.0 && p <= 1.0) {
            bail!("generation.top_p must be in (0.0, 1.0]");
        }
    }
    if config.generation.top_k == Some(0) {
        bail!("generation.top_k must be >= 1");
    }
    if config.generation.model.trim().is_empty() {
        bail!("generation.model must not be empty");
    }
    match config.generation.provider.as_str() {
        "gemini" | "openai" => {}
        other => bail!(
            "Unknown generation provider: '{}'. Must be gemini or openai.",
            other
        ),
    }

    match config.embedding.provider.as_str() {
        "disabled" | "gemini" | "openai" | "ollama" | "local" => {}
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled, gemini, openai, ollama, or local.",
            other
        ),
    }
    if config.embedding.is_enabled() && config.embedding.provider != "local" {
        if config.embedding.model.is_none() {
            bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
    }

    if config.context.mode == ContextMode::Retrieval && !config.embedding.is_enabled() {
        bail!("context.mode = \"retrieval\" requires an [embedding] provider");
    }

    if config.prompt.persona.trim().is_empty() {
        bail!("prompt.persona must not be empty");
    }
    if config.prompt.refusal.trim().is_empty() {
        bail!("prompt.refusal must not be empty");
    }

    Ok(())
}
