use std::pin::Pin;
use std::sync::Arc;

use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::error::Result;
use crate::models::{BookConfiguration, Outline, estimate_tokens};
use crate::services::llm::{CompletionRequest, LlmProvider};
use crate::services::prompts;

/// One message on a chapter stream. `Complete` and `Error` are terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "tipo", content = "contenido")]
pub enum ChapterEvent {
    #[serde(rename = "chunk")]
    Chunk(String),
    #[serde(rename = "completo")]
    Complete(String),
    #[serde(rename = "error")]
    Error(String),
}

pub type ChapterStream = Pin<Box<dyn Stream<Item = ChapterEvent> + Send>>;

pub struct ChapterClient {
    provider: Arc<dyn LlmProvider>,
    model: String,
}

impl ChapterClient {
    pub fn new(provider: Arc<dyn LlmProvider>, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
        }
    }

    /// Starts streaming chapter `number`.
    ///
    /// Only prompt construction can fail here; provider and transport
    /// failures arrive as a single terminal [`ChapterEvent::Error`]. Chunks
    /// already delivered are never retracted, so callers must drop their
    /// partial text when they see an error.
    #[instrument(skip(self, outline, config, prior_summaries), fields(prior = prior_summaries.len()))]
    pub fn stream_chapter(
        &self,
        number: u32,
        outline: &Outline,
        config: &BookConfiguration,
        prior_summaries: &[String],
    ) -> Result<ChapterStream> {
        let prompt = prompts::chapter_prompt(number, outline, config, prior_summaries)?;
        debug!(tokens = estimate_tokens(&prompt), "built chapter prompt");

        let request = CompletionRequest {
            model: config.model.clone().unwrap_or_else(|| self.model.clone()),
            prompt,
            max_tokens: 8000,
            temperature: None,
        };
        let provider = Arc::clone(&self.provider);

        let stream = async_stream::stream! {
            let mut upstream = match provider.stream(request).await {
                Ok(upstream) => upstream,
                Err(e) => {
                    warn!(chapter = number, error = %e, "chapter stream could not start");
                    yield ChapterEvent::Error(e.to_string());
                    return;
                }
            };

            let mut full_text = String::new();
            let mut chunks = 0usize;
            while let Some(delta) = upstream.next().await {
                match delta {
                    Ok(text) if text.is_empty() => {}
                    Ok(text) => {
                        chunks += 1;
                        full_text.push_str(&text);
                        if chunks % 50 == 0 {
                            debug!(chapter = number, chunks, chars = full_text.len(), "streaming");
                        }
                        yield ChapterEvent::Chunk(text);
                    }
                    Err(e) => {
                        warn!(chapter = number, chunks, error = %e, "chapter stream failed");
                        yield ChapterEvent::Error(e.to_string());
                        return;
                    }
                }
            }

            info!(chapter = number, chunks, chars = full_text.len(), "chapter stream completed");
            yield ChapterEvent::Complete(full_text);
        };

        Ok(Box::pin(stream))
    }
}
