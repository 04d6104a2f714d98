use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::{json, Value};

use super::sse::SseDecoder;
use super::{check_status, http_client, AnswerStream, GenerationRequest, Generator, StreamSender};
use crate::config::GenerationConfig;
use crate::secrets::Secret;

const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com";

/// Google Generative Language API (`generateContent`).
///
/// Authenticates with the process API key in the `x-goog-api-key` header.
pub struct GeminiGenerator {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Secret,
}

impl GeminiGenerator {
    pub fn new(config: &GenerationConfig, api_key: Secret) -> Result<Self> {
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| GEMINI_BASE_URL.to_string());
        Ok(Self {
            client: http_client(config)?,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key,
        })
    }

    fn endpoint(&self, method: &str) -> String {
        format!("{}/v1beta/models/{}:{}", self.base_url, self.model, method)
    }
}

#[async_trait]
impl Generator for GeminiGenerator {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<String> {
        tracing::debug!(model = %self.model, "gemini generateContent");
        let response = self
            .client
            .post(self.endpoint("generateContent"))
            .header("x-goog-api-key", self.api_key.expose())
            .json(&request_body(request))
            .send()
            .await
            .context("Gemini connection error")?;
        let response = check_status("Gemini", response).await?;
        let json: Value = response.json().await.context("Gemini response body")?;

        let chunk = parse_chunk(&json)?;
        if !chunk.finished {
            tracing::debug!("gemini response carried no finishReason");
        }
        Ok(chunk.text)
    }

    async fn stream(&self, request: &GenerationRequest) -> Result<AnswerStream> {
        tracing::debug!(model = %self.model, "gemini streamGenerateContent");
        let response = self
            .client
            .post(format!("{}?alt=sse", self.endpoint("streamGenerateContent")))
            .header("x-goog-api-key", self.api_key.expose())
            .json(&request_body(request))
            .send()
            .await
            .context("Gemini connection error")?;
        let response = check_status("Gemini", response).await?;

        let (tx, stream) = AnswerStream::channel();
        tokio::spawn(pump(response, tx));
        Ok(stream)
    }
}

/// Decodes the SSE body into fragments until a chunk carries a
/// `finishReason`.
async fn pump(response: reqwest::Response, tx: StreamSender) {
    let mut body = response.bytes_stream();
    let mut decoder = SseDecoder::new();
    let mut finished = false;

    while let Some(item) = body.next().await {
        let bytes = match item {
            Ok(bytes) => bytes,
            Err(e) => {
                tx.fail(anyhow!(e).context("Gemini stream interrupted")).await;
                return;
            }
        };
        for event in decoder.push(&bytes) {
            match handle_event(&event.data, &tx).await {
                Ok(true) => finished = true,
                Ok(false) => {}
                Err(e) => {
                    tx.fail(e).await;
                    return;
                }
            }
        }
    }
    if let Some(event) = decoder.finish() {
        match handle_event(&event.data, &tx).await {
            Ok(done) => finished |= done,
            Err(e) => {
                tx.fail(e).await;
                return;
            }
        }
    }

    if finished {
        tx.finish().await;
    }
    // Otherwise dropping `tx` reports the truncation to the consumer.
}

async fn handle_event(data: &str, tx: &StreamSender) -> Result<bool> {
    let json: Value = serde_json::from_str(data).context("Gemini stream: invalid JSON event")?;
    let chunk = parse_chunk(&json)?;
    if !chunk.text.is_empty() && !tx.fragment(chunk.text).await {
        bail!("answer stream consumer went away");
    }
    Ok(chunk.finished)
}

fn request_body(request: &GenerationRequest) -> Value {
    let mut generation_config = serde_json::Map::new();
    if let Some(t) = request.params.temperature {
        generation_config.insert("temperature".to_string(), json!(t));
    }
    if let Some(p) = request.params.top_p {
        generation_config.insert("topP".to_string(), json!(p));
    }
    if let Some(k) = request.params.top_k {
        generation_config.insert("topK".to_string(), json!(k));
    }

    let mut body = json!({
        "systemInstruction": {
            "parts": [{ "text": request.system_instruction }]
        },
        "contents": [{
            "role": "user",
            "parts": [{ "text": request.user_content }]
        }],
    });
    if !generation_config.is_empty() {
        body["generationConfig"] = Value::Object(generation_config);
    }
    body
}

/// Stop reasons after which the partial answer must not be kept.
const BLOCKED_FINISH_REASONS: &[&str] = &[
    "SAFETY",
    "RECITATION",
    "BLOCKLIST",
    "PROHIBITED_CONTENT",
    "SPII",
];

#[derive(Debug, PartialEq)]
struct GeminiChunk {
    text: String,
    finished: bool,
}

/// Parses one `GenerateContentResponse` (a whole answer or one stream
/// event).
fn parse_chunk(json: &Value) -> Result<GeminiChunk> {
    if let Some(err) = json.get("error") {
        let message = err
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or("unknown error");
        bail!("Gemini API error: {}", message);
    }
    if let Some(reason) = json
        .pointer("/promptFeedback/blockReason")
        .and_then(|r| r.as_str())
    {
        bail!("Gemini blocked the prompt: {}", reason);
    }

    let Some(candidate) = json.pointer("/candidates/0") else {
        // Usage-only trailer events carry no candidates.
        return Ok(GeminiChunk {
            text: String::new(),
            finished: false,
        });
    };

    let text = candidate
        .pointer("/content/parts")
        .and_then(|p| p.as_array())
        .map(|parts| {
            parts
                .iter()
                .filter(|p| !p.get("thought").and_then(|t| t.as_bool()).unwrap_or(false))
                .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                .collect::<String>()
        })
        .unwrap_or_default();
    let reason = candidate
        .get("finishReason")
        .and_then(|r| r.as_str())
        .unwrap_or_default();
    if BLOCKED_FINISH_REASONS.contains(&reason) {
        bail!("Gemini stopped the answer: {}", reason);
    }
    let finished = !reason.is_empty() && reason != "FINISH_REASON_UNSPECIFIED";

    Ok(GeminiChunk { text, finished })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::SamplingParams;

    fn request(params: SamplingParams) -> GenerationRequest {
        GenerationRequest {
            system_instruction: "persona".to_string(),
            user_content: "안녕".to_string(),
            params,
        }
    }

    #[test]
    fn body_carries_instruction_content_and_sampling() {
        let body = request_body(&request(SamplingParams {
            temperature: Some(0.2),
            top_p: Some(0.9),
            top_k: Some(40),
        }));
        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "persona");
        assert_eq!(body["contents"][0]["role"], "user");
        assert_eq!(body["contents"][0]["parts"][0]["text"], "안녕");
        assert_eq!(body["generationConfig"]["topK"], 40);
        assert!(body["generationConfig"]["topP"].as_f64().is_some());
    }

    #[test]
    fn body_omits_unset_sampling() {
        let body = request_body(&request(SamplingParams::default()));
        assert!(body.get("generationConfig").is_none());
    }

    #[test]
    fn parses_text_parts_and_finish_reason() {
        let json = json!({
            "candidates": [{
                "content": { "parts": [{ "text": "안녕" }, { "text": "하세요" }] },
                "finishReason": "STOP"
            }]
        });
        assert_eq!(
            parse_chunk(&json).unwrap(),
            GeminiChunk {
                text: "안녕하세요".to_string(),
                finished: true
            }
        );
    }

    #[test]
    fn skips_thought_parts() {
        let json = json!({
            "candidates": [{
                "content": { "parts": [{ "text": "plan", "thought": true }, { "text": "answer" }] }
            }]
        });
        let chunk = parse_chunk(&json).unwrap();
        assert_eq!(chunk.text, "answer");
        assert!(!chunk.finished);
    }

    #[test]
    fn api_error_and_block_are_errors() {
        let err =
            parse_chunk(&json!({ "error": { "code": 429, "message": "quota" } })).unwrap_err();
        assert!(err.to_string().contains("quota"));
        let err =
            parse_chunk(&json!({ "promptFeedback": { "blockReason": "SAFETY" } })).unwrap_err();
        assert!(err.to_string().contains("SAFETY"));
    }

    #[test]
    fn safety_stop_is_an_error() {
        let json = json!({
            "candidates": [{
                "content": { "parts": [{ "text": "일부" }] },
                "finishReason": "SAFETY"
            }]
        });
        let err = parse_chunk(&json).unwrap_err();
        assert!(err.to_string().contains("SAFETY"));

        let recitation = json!({ "candidates": [{ "finishReason": "RECITATION" }] });
        assert!(parse_chunk(&recitation).is_err());

        let max_tokens = json!({ "candidates": [{ "finishReason": "MAX_TOKENS" }] });
        assert!(parse_chunk(&max_tokens).unwrap().finished);
    }

    #[tokio::test]
    async fn safety_stop_mid_stream_fails_the_answer() {
        let (tx, mut stream) = AnswerStream::channel();
        assert!(!handle_event(
            r#"{"candidates":[{"content":{"parts":[{"text":"부분"}]}}]}"#,
            &tx,
        )
        .await
        .unwrap());
        let err = handle_event(r#"{"candidates":[{"finishReason":"SAFETY"}]}"#, &tx)
            .await
            .unwrap_err();
        tx.fail(err).await;
        assert_eq!(stream.next().await.unwrap().unwrap(), "부분");
        assert!(stream.next().await.unwrap().is_err());
    }

    #[tokio::test]
    async fn events_without_finish_reason_do_not_complete() {
        let (tx, mut stream) = AnswerStream::channel();
        let done = handle_event(
            r#"{"candidates":[{"content":{"parts":[{"text":"부분"}]}}]}"#,
            &tx,
        )
        .await
        .unwrap();
        assert!(!done);
        drop(tx);
        assert_eq!(stream.next().await.unwrap().unwrap(), "부분");
        assert!(stream.next().await.unwrap().is_err());
    }
}
