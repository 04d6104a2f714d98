use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::{json, Value};

use super::sse::SseDecoder;
use super::{check_status, http_client, AnswerStream, GenerationRequest, Generator, StreamSender};
use crate::config::GenerationConfig;
use crate::secrets::Secret;

const OPENAI_BASE_URL: &str = "https://api.openai.com";
const DONE_SENTINEL: &str = "[DONE]";

/// OpenAI-compatible chat completions (`/v1/chat/completions`).
///
/// Works against OpenAI itself or any server speaking the same protocol
/// (set `[generation] base_url`). `top_k` has no equivalent there and is
/// not sent.
pub struct OpenAIGenerator {
    client: reqwest::Client,
    url: String,
    model: String,
    api_key: Secret,
}

impl OpenAIGenerator {
    pub fn new(config: &GenerationConfig, api_key: Secret) -> Result<Self> {
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| OPENAI_BASE_URL.to_string());
        Ok(Self {
            client: http_client(config)?,
            url: format!("{}/v1/chat/completions", base_url.trim_end_matches('/')),
            model: config.model.clone(),
            api_key,
        })
    }

    async fn send(&self, request: &GenerationRequest, stream: bool) -> Result<reqwest::Response> {
        if request.params.top_k.is_some() {
            tracing::debug!("top_k is not supported by chat completions; ignoring");
        }
        let response = self
            .client
            .post(&self.url)
            .bearer_auth(self.api_key.expose())
            .json(&request_body(&self.model, request, stream))
            .send()
            .await
            .context("OpenAI connection error")?;
        check_status("OpenAI", response).await
    }
}

#[async_trait]
impl Generator for OpenAIGenerator {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<String> {
        let response = self.send(request, false).await?;
        let json: Value = response.json().await.context("OpenAI response body")?;
        json.pointer("/choices/0/message/content")
            .and_then(|c| c.as_str())
            .map(str::to_string)
            .ok_or_else(|| anyhow!("OpenAI response has no message content"))
    }

    async fn stream(&self, request: &GenerationRequest) -> Result<AnswerStream> {
        let response = self.send(request, true).await?;
        let (tx, stream) = AnswerStream::channel();
        tokio::spawn(pump(response, tx));
        Ok(stream)
    }
}

async fn pump(response: reqwest::Response, tx: StreamSender) {
    let mut body = response.bytes_stream();
    let mut decoder = SseDecoder::new();

    while let Some(item) = body.next().await {
        let bytes = match item {
            Ok(bytes) => bytes,
            Err(e) => {
                tx.fail(anyhow!(e).context("OpenAI stream interrupted")).await;
                return;
            }
        };
        for event in decoder.push(&bytes) {
            if event.data.trim() == DONE_SENTINEL {
                tx.finish().await;
                return;
            }
            if let Err(e) = forward_delta(&event.data, &tx).await {
                tx.fail(e).await;
                return;
            }
        }
    }
    if let Some(event) = decoder.finish() {
        if event.data.trim() == DONE_SENTINEL {
            tx.finish().await;
        }
    }
    // No sentinel: dropping `tx` reports the truncation.
}

async fn forward_delta(data: &str, tx: &StreamSender) -> Result<()> {
    let json: Value = serde_json::from_str(data).context("OpenAI stream: invalid JSON event")?;
    if let Some(message) = json.pointer("/error/message").and_then(|m| m.as_str()) {
        bail!("OpenAI API error: {}", message);
    }
    let content = json
        .pointer("/choices/0/delta/content")
        .and_then(|c| c.as_str())
        .unwrap_or_default();
    if !content.is_empty() && !tx.fragment(content).await {
        bail!("answer stream consumer went away");
    }
    Ok(())
}

fn request_body(model: &str, request: &GenerationRequest, stream: bool) -> Value {
    let mut body = json!({
        "model": model,
        "messages": [
            { "role": "system", "content": request.system_instruction },
            { "role": "user", "content": request.user_content },
        ],
        "stream": stream,
    });
    if let Some(obj) = body.as_object_mut() {
        if let Some(t) = request.params.temperature {
            obj.insert("temperature".to_string(), json!(t));
        }
        if let Some(p) = request.params.top_p {
            obj.insert("top_p".to_string(), json!(p));
        }
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::SamplingParams;

    #[test]
    fn body_has_system_then_user_message() {
        let request = GenerationRequest {
            system_instruction: "persona".to_string(),
            user_content: "question".to_string(),
            params: SamplingParams {
                temperature: Some(0.0),
                top_p: None,
                top_k: Some(10),
            },
        };
        let body = request_body("gpt-4o-mini", &request, true);
        assert_eq!(body["model"], "gpt-4o-mini");
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "question");
        assert_eq!(body["stream"], true);
        assert!(body.get("temperature").is_some());
        assert!(body.get("top_p").is_none());
        assert!(body.get("top_k").is_none());
    }

    #[tokio::test]
    async fn deltas_are_forwarded() {
        let (tx, mut stream) = AnswerStream::channel();
        forward_delta(r#"{"choices":[{"delta":{"content":"hi"}}]}"#, &tx)
            .await
            .unwrap();
        forward_delta(r#"{"choices":[{"delta":{"role":"assistant"}}]}"#, &tx)
            .await
            .unwrap();
        tx.finish().await;
        assert_eq!(stream.next().await.unwrap().unwrap(), "hi");
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn error_event_is_an_error() {
        let (tx, _stream) = AnswerStream::channel();
        let err = forward_delta(r#"{"error":{"message":"rate limited"}}"#, &tx)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("rate limited"));
    }
}
