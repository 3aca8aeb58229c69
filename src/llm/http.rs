//! OpenAI-compatible chat completions client

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use url::Url;

use super::{IntentClassifier, LanguageModel, LlmEvent, Reply};
use crate::conversation::{PromptContext, PromptMessage, TurnMetadata};
use crate::{Error, Result};

/// Separates spoken text from the trailing metadata block in streamed replies
pub const META_MARKER: &str = "###META";

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [PromptMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Option<StreamDelta>,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BatchReply {
    message: String,
    #[serde(default)]
    coverage_confirmed: Option<bool>,
    #[serde(default)]
    end_conversation: bool,
}

fn strip_code_fence(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let inner = inner.strip_prefix("json").unwrap_or(inner);
    inner.strip_suffix("```").unwrap_or(inner).trim()
}

/// Parse the JSON object a batch reply must contain
///
/// # Errors
///
/// Returns `Error::Protocol` if the content is not the expected object
pub fn parse_batch_reply(content: &str) -> Result<Reply> {
    let reply: BatchReply = serde_json::from_str(strip_code_fence(content))
        .map_err(|e| Error::Protocol(format!("malformed LLM reply: {e}")))?;
    Ok(Reply {
        message: reply.message.trim().to_string(),
        metadata: TurnMetadata {
            coverage_confirmed: reply.coverage_confirmed,
            end_conversation: reply.end_conversation,
        },
    })
}

/// Holds back streamed text that may belong to the metadata marker
#[derive(Debug, Default)]
pub struct MetaSplitter {
    pending: String,
    meta: Option<String>,
}

impl MetaSplitter {
    /// Empty splitter
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a fragment; returns the text safe to speak now
    pub fn push(&mut self, fragment: &str) -> String {
        if let Some(meta) = self.meta.as_mut() {
            meta.push_str(fragment);
            return String::new();
        }

        self.pending.push_str(fragment);
        if let Some(idx) = self.pending.find(META_MARKER) {
            let visible = self.pending[..idx].to_string();
            self.meta = Some(self.pending[idx + META_MARKER.len()..].to_string());
            self.pending.clear();
            return visible;
        }

        // keep any tail that could be the start of the marker
        let keep = (1..META_MARKER.len())
            .rev()
            .find(|&n| self.pending.ends_with(&META_MARKER[..n]))
            .unwrap_or(0);
        let split = self.pending.len() - keep;
        let visible = self.pending[..split].to_string();
        self.pending.drain(..split);
        visible
    }

    /// Flush held text and parse the metadata block, if any
    pub fn finish(&mut self) -> (String, Option<TurnMetadata>) {
        let rest = std::mem::take(&mut self.pending);
        let metadata = self.meta.take().and_then(|block| {
            let parsed = serde_json::from_str::<TurnMetadata>(strip_code_fence(&block));
            if let Err(e) = &parsed {
                tracing::debug!(error = %e, block = %block, "unparsable metadata block");
            }
            parsed.ok()
        });
        (rest, metadata)
    }
}

/// Chat-completions client for any OpenAI-compatible endpoint
pub struct OpenAiCompatibleModel {
    client: reqwest::Client,
    base_url: Url,
    model: String,
    api_key: Option<SecretString>,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
    json_mode: bool,
    classifier: Arc<dyn IntentClassifier>,
}

impl OpenAiCompatibleModel {
    /// Client for `model` at `base_url` (e.g. `https://api.openai.com/v1/`)
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be built
    pub fn new(
        base_url: Url,
        model: String,
        api_key: Option<SecretString>,
        request_timeout: Duration,
        classifier: Arc<dyn IntentClassifier>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .read_timeout(request_timeout)
            .build()?;
        Ok(Self {
            client,
            base_url,
            model,
            api_key,
            temperature: Some(0.4),
            max_tokens: Some(300),
            json_mode: true,
            classifier,
        })
    }

    /// Sampling temperature
    #[must_use]
    pub const fn with_temperature(mut self, temperature: Option<f32>) -> Self {
        self.temperature = temperature;
        self
    }

    /// Completion length cap
    #[must_use]
    pub const fn with_max_tokens(mut self, max_tokens: Option<u32>) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Ask the server for a JSON object in batch mode
    #[must_use]
    pub const fn with_json_mode(mut self, json_mode: bool) -> Self {
        self.json_mode = json_mode;
        self
    }

    async fn send(&self, context: &PromptContext, stream: bool) -> Result<reqwest::Response> {
        let url = self
            .base_url
            .join("chat/completions")
            .map_err(|e| Error::Config(format!("invalid LLM base URL: {e}")))?;

        let body = ChatRequest {
            model: &self.model,
            messages: &context.messages,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            stream,
            response_format: (!stream && self.json_mode).then_some(ResponseFormat { kind: "json_object" }),
        };

        let mut request = self.client.post(url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key.expose_secret());
        }

        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let text = response.text().await.unwrap_or_default();
        tracing::error!(status = %status, body = %text, model = %self.model, "LLM API error");
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            Err(Error::ServiceUnavailable(format!("LLM API {status}: {text}")))
        } else {
            Err(Error::Llm(format!("LLM API {status}: {text}")))
        }
    }
}

/// Byte buffer that yields complete SSE lines
///
/// Network chunks may split a multibyte character; decoding waits for the
/// line's `\n`, which never occurs inside a UTF-8 sequence.
#[derive(Debug, Default)]
struct SseLineBuffer {
    bytes: Vec<u8>,
}

impl SseLineBuffer {
    fn extend(&mut self, chunk: &[u8]) {
        self.bytes.extend_from_slice(chunk);
    }

    /// Next complete line, trimmed
    fn next_line(&mut self) -> Option<String> {
        let line_end = self.bytes.iter().position(|&b| b == b'\n')?;
        let line: Vec<u8> = self.bytes.drain(..=line_end).collect();
        match std::str::from_utf8(&line) {
            Ok(text) => Some(text.trim().to_string()),
            Err(e) => {
                tracing::debug!(error = %e, "skipping non-UTF-8 SSE line");
                Some(String::new())
            }
        }
    }
}

/// Extract the content delta from one SSE line, if any
fn parse_sse_line(line: &str) -> SseLine {
    let Some(data) = line.strip_prefix("data:") else {
        return SseLine::Skip;
    };
    let data = data.trim();
    if data == "[DONE]" {
        return SseLine::Done;
    }
    match serde_json::from_str::<StreamChunk>(data) {
        Ok(chunk) => chunk
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.delta)
            .and_then(|d| d.content)
            .map_or(SseLine::Skip, SseLine::Content),
        Err(e) => {
            tracing::debug!(error = %e, "skipping unparsable SSE chunk");
            SseLine::Skip
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum SseLine {
    Content(String),
    Done,
    Skip,
}

#[async_trait]
impl LanguageModel for OpenAiCompatibleModel {
    fn name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, context: &PromptContext) -> Result<Reply> {
        let response = self.send(context, false).await?;
        let chat: ChatResponse = response
            .json()
            .await
            .map_err(|e| Error::Protocol(format!("unexpected LLM response: {e}")))?;

        let content = chat
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| Error::Protocol("LLM response has no content".to_string()))?;

        let reply = parse_batch_reply(&content)?;
        tracing::debug!(chars = reply.message.len(), metadata = ?reply.metadata, "batch reply");
        Ok(reply)
    }

    async fn stream(&self, context: &PromptContext) -> Result<mpsc::Receiver<LlmEvent>> {
        let response = self.send(context, true).await?;
        let (tx, rx) = mpsc::channel(64);
        let classifier = Arc::clone(&self.classifier);
        let user_message = context.last_user_message().map(str::to_string);

        tokio::spawn(async move {
            let mut bytes = response.bytes_stream();
            let mut buffer = SseLineBuffer::default();
            let mut splitter = MetaSplitter::new();
            let mut spoken = String::new();
            let mut done = false;

            'read: while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        tracing::warn!(error = %e, "LLM stream interrupted");
                        return;
                    }
                };
                buffer.extend(&chunk);

                while let Some(line) = buffer.next_line() {
                    match parse_sse_line(&line) {
                        SseLine::Skip => {}
                        SseLine::Done => {
                            done = true;
                            break 'read;
                        }
                        SseLine::Content(delta) => {
                            let visible = splitter.push(&delta);
                            if visible.is_empty() {
                                continue;
                            }
                            spoken.push_str(&visible);
                            if tx.send(LlmEvent::TextFragment(visible)).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            }

            if !done {
                tracing::warn!("LLM stream ended without [DONE]");
                return;
            }

            let (rest, metadata) = splitter.finish();
            if !rest.is_empty() {
                spoken.push_str(&rest);
                if tx.send(LlmEvent::TextFragment(rest)).await.is_err() {
                    return;
                }
            }

            let metadata = metadata
                .unwrap_or_else(|| classifier.classify(user_message.as_deref(), &spoken));
            let _ = tx.send(LlmEvent::Done { metadata: Some(metadata) }).await;
        });

        Ok(rx)
    }
}
