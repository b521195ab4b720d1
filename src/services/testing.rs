//! Scripted provider for tests.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::{AppError, Result};
use crate::services::llm::{CompletionRequest, LlmProvider, TextStream};

#[derive(Default)]
pub struct FakeProvider {
    completions: Mutex<VecDeque<Result<String>>>,
    streams: Mutex<VecDeque<Vec<Result<String>>>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_completion(&self, text: impl Into<String>) {
        self.completions.lock().unwrap().push_back(Ok(text.into()));
    }

    pub fn push_completion_error(&self, error: AppError) {
        self.completions.lock().unwrap().push_back(Err(error));
    }

    /// Queues one streamed answer delivered as the given deltas.
    pub fn push_stream<S: Into<String>>(&self, deltas: impl IntoIterator<Item = S>) {
        let items = deltas.into_iter().map(|d| Ok(d.into())).collect();
        self.streams.lock().unwrap().push_back(items);
    }

    pub fn push_stream_items(&self, items: Vec<Result<String>>) {
        self.streams.lock().unwrap().push_back(items);
    }

    pub fn prompts(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.prompt.clone())
            .collect()
    }

    pub fn models(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.model.clone())
            .collect()
    }
}

#[async_trait]
impl LlmProvider for FakeProvider {
    async fn complete(&self, request: CompletionRequest) -> Result<String> {
        self.requests.lock().unwrap().push(request);
        self.completions
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(AppError::Provider("no scripted completion".into())))
    }

    async fn stream(&self, request: CompletionRequest) -> Result<TextStream> {
        self.requests.lock().unwrap().push(request);
        let items = self
            .streams
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| AppError::Provider("no scripted stream".into()))?;
        Ok(Box::pin(futures_util::stream::iter(items)))
    }
}
