use std::pin::Pin;

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, error, instrument};

use crate::config::Config;
use crate::error::{AppError, Result};
use crate::services::sse::{SseDecoder, SseFrame};

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Incremental text deltas from a streaming completion.
pub type TextStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub model: String,
    pub prompt: String,
    pub max_tokens: u32,
    pub temperature: Option<f32>,
}

/// A text-completion backend. Every request carries a single user prompt.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<String>;

    async fn stream(&self, request: CompletionRequest) -> Result<TextStream>;
}

/// Client for the Anthropic messages endpoint.
pub struct LLMClient {
    client: reqwest::Client,
    api_url: String,
    api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageResponse {
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
}

impl LLMClient {
    pub fn new(config: &Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| AppError::Provider(format!("could not build HTTP client: {e}")))?;

        Ok(LLMClient {
            client,
            api_url: config.api_url.clone(),
            api_key: config.api_key.clone(),
        })
    }

    async fn send(&self, request: &CompletionRequest, stream: bool) -> Result<reqwest::Response> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or(AppError::MissingCredentials("ANTHROPIC_API_KEY"))?;

        let mut body = json!({
            "model": request.model,
            "max_tokens": request.max_tokens,
            "messages": [{ "role": "user", "content": request.prompt }],
            "stream": stream,
        });
        if let Some(temperature) = request.temperature {
            body["temperature"] = json!(temperature);
        }

        let response = self
            .client
            .post(&self.api_url)
            .header("x-api-key", api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                error!(error = ?e, "failed to reach provider");
                AppError::Provider(format!("request failed: {e}"))
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %body, "provider returned error");
            return Err(AppError::Provider(format!("status {status}: {body}")));
        }

        Ok(response)
    }
}

#[async_trait]
impl LlmProvider for LLMClient {
    #[instrument(skip(self, request), fields(model = %request.model, prompt_len = request.prompt.len()))]
    async fn complete(&self, request: CompletionRequest) -> Result<String> {
        let response = self.send(&request, false).await?;
        let message: MessageResponse = response
            .json()
            .await
            .map_err(|e| AppError::Provider(format!("unreadable response: {e}")))?;

        match message.content.into_iter().next() {
            Some(block) if block.kind == "text" => {
                debug!(chars = block.text.len(), "received completion");
                Ok(block.text)
            }
            _ => Err(AppError::Provider("unexpected response content".to_string())),
        }
    }

    #[instrument(skip(self, request), fields(model = %request.model, prompt_len = request.prompt.len()))]
    async fn stream(&self, request: CompletionRequest) -> Result<TextStream> {
        let response = self.send(&request, true).await?;
        let mut body = response.bytes_stream();

        let stream = async_stream::stream! {
            let mut decoder = SseDecoder::new();
            while let Some(chunk) = body.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        yield Err(AppError::Stream(format!("stream interrupted: {e}")));
                        return;
                    }
                };
                for frame in decoder.push(&chunk) {
                    match text_delta(&frame) {
                        Ok(Some(text)) => yield Ok(text),
                        Ok(None) => {}
                        Err(e) => {
                            yield Err(e);
                            return;
                        }
                    }
                }
            }
            if let Some(frame) = decoder.finish() {
                match text_delta(&frame) {
                    Ok(Some(text)) => yield Ok(text),
                    Ok(None) => {}
                    Err(e) => yield Err(e),
                }
            }
        };

        Ok(Box::pin(stream))
    }
}

/// Extracts the text of a `content_block_delta` event; other events yield nothing.
fn text_delta(frame: &SseFrame) -> Result<Option<String>> {
    if frame.data.trim().is_empty() {
        return Ok(None);
    }
    let value: serde_json::Value = match serde_json::from_str(&frame.data) {
        Ok(value) => value,
        Err(e) => {
            debug!(error = %e, "skipping undecodable stream frame");
            return Ok(None);
        }
    };

    match value["type"].as_str() {
        Some("content_block_delta") if value["delta"]["type"] == "text_delta" => {
            Ok(value["delta"]["text"].as_str().map(str::to_string))
        }
        Some("error") => {
            let message = value["error"]["message"]
                .as_str()
                .unwrap_or("unknown provider error");
            Err(AppError::Stream(message.to_string()))
        }
        _ => Ok(None),
    }
}
