//! Answer generation against a hosted LLM.
//!
//! Defines the [`Generator`] trait and the two hosted implementations:
//! - **[`GeminiGenerator`]**: Google Generative Language REST API.
//! - **[`OpenAIGenerator`]**: any OpenAI-compatible `/v1/chat/completions` endpoint.
//!
//! Streaming answers are delivered through an [`AnswerStream`]: a
//! single-consumer channel fed by a producer task that decodes the
//! provider's server-sent events. The producer must report the provider's
//! completion signal; a stream that simply stops (connection dropped,
//! timeout) ends with an error item instead of looking like a short answer.
//!
//! Generation calls are never retried. A failed turn is surfaced to the
//! user, who can ask again.

mod gemini;
mod openai;
pub mod sse;

pub use gemini::GeminiGenerator;
pub use openai::OpenAIGenerator;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::config::GenerationConfig;
use crate::secrets::Secret;

const STREAM_CAPACITY: usize = 32;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SamplingParams {
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub top_k: Option<u32>,
}

impl SamplingParams {
    pub fn from_config(config: &GenerationConfig) -> Self {
        Self {
            temperature: config.temperature,
            top_p: config.top_p,
            top_k: config.top_k,
        }
    }
}

/// Everything a provider needs for one answer.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub system_instruction: String,
    pub user_content: String,
    pub params: SamplingParams,
}

#[async_trait]
pub trait Generator: Send + Sync {
    fn model_name(&self) -> &str;

    /// Returns the complete answer in one piece.
    async fn generate(&self, request: &GenerationRequest) -> Result<String>;

    /// Starts a streaming answer. Errors here mean the request was refused
    /// before any fragment was produced; later failures arrive through the
    /// stream.
    async fn stream(&self, request: &GenerationRequest) -> Result<AnswerStream>;
}

enum StreamEvent {
    Fragment(String),
    Failed(anyhow::Error),
    Finished,
}

/// Producer half of an [`AnswerStream`].
///
/// Dropping the sender without calling [`finish`](Self::finish) or
/// [`fail`](Self::fail) makes the stream end with a truncation error.
pub struct StreamSender {
    tx: mpsc::Sender<StreamEvent>,
}

impl StreamSender {
    /// Sends one fragment. Returns `false` once the consumer is gone.
    pub async fn fragment(&self, text: impl Into<String>) -> bool {
        self.tx.send(StreamEvent::Fragment(text.into())).await.is_ok()
    }

    pub async fn fail(self, err: anyhow::Error) {
        let _ = self.tx.send(StreamEvent::Failed(err)).await;
    }

    /// Marks the answer complete.
    pub async fn finish(self) {
        let _ = self.tx.send(StreamEvent::Finished).await;
    }
}

/// Forward-only sequence of answer fragments, consumed once.
pub struct AnswerStream {
    rx: mpsc::Receiver<StreamEvent>,
    done: bool,
}

impl AnswerStream {
    pub fn channel() -> (StreamSender, AnswerStream) {
        let (tx, rx) = mpsc::channel(STREAM_CAPACITY);
        (StreamSender { tx }, AnswerStream { rx, done: false })
    }

    /// A completed stream over fixed fragments.
    pub fn from_fragments<I, S>(fragments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let fragments: Vec<String> = fragments.into_iter().map(Into::into).collect();
        let (tx, rx) = mpsc::channel(fragments.len() + 1);
        for fragment in fragments {
            let _ = tx.try_send(StreamEvent::Fragment(fragment));
        }
        let _ = tx.try_send(StreamEvent::Finished);
        AnswerStream { rx, done: false }
    }

    /// Next fragment, or `None` once the provider signalled completion.
    /// After an error item the stream is exhausted.
    pub async fn next(&mut self) -> Option<Result<String>> {
        if self.done {
            return None;
        }
        match self.rx.recv().await {
            Some(StreamEvent::Fragment(text)) => Some(Ok(text)),
            Some(StreamEvent::Failed(err)) => {
                self.done = true;
                Some(Err(err))
            }
            Some(StreamEvent::Finished) => {
                self.done = true;
                None
            }
            None => {
                self.done = true;
                Some(Err(anyhow!(
                    "answer stream ended before the provider signalled completion"
                )))
            }
        }
    }

    /// Drains the stream into one string.
    pub async fn collect(mut self) -> Result<String> {
        let mut answer = String::new();
        while let Some(fragment) = self.next().await {
            answer.push_str(&fragment?);
        }
        Ok(answer)
    }
}

pub(crate) fn http_client(config: &GenerationConfig) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()?)
}

/// Fails with the response body when `response` is not a success.
pub(crate) async fn check_status(
    label: &str,
    response: reqwest::Response,
) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    bail!("{} API error {}: {}", label, status, body.trim())
}

/// Create the [`Generator`] named by `[generation] provider`.
///
/// | Config Value | Generator |
/// |-------------|-----------|
/// | `"gemini"` | [`GeminiGenerator`] |
/// | `"openai"` | [`OpenAIGenerator`] |
pub fn create_generator(config: &GenerationConfig, api_key: Secret) -> Result<Arc<dyn Generator>> {
    Ok(match config.provider.as_str() {
        "gemini" => Arc::new(GeminiGenerator::new(config, api_key)?),
        "openai" => Arc::new(OpenAIGenerator::new(config, api_key)?),
        other => bail!("Unknown generation provider: {}", other),
    })
}
