use std::sync::Arc;

use tracing::instrument;

use crate::error::{AppError, Result};
use crate::services::llm::{CompletionRequest, LlmProvider};
use crate::services::prompts;

/// One-shot rewrites: chapter revision and topic improvement.
pub struct RevisionClient {
    provider: Arc<dyn LlmProvider>,
    model: String,
}

impl RevisionClient {
    pub fn new(provider: Arc<dyn LlmProvider>, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
        }
    }

    #[instrument(skip_all, fields(content_len = content.len()))]
    pub async fn revise(&self, content: &str, instructions: &str) -> Result<String> {
        if content.trim().is_empty() {
            return Err(AppError::Configuration(
                "El contenido del capítulo es requerido".to_string(),
            ));
        }
        if instructions.trim().is_empty() {
            return Err(AppError::Configuration(
                "Las instrucciones de revisión son requeridas".to_string(),
            ));
        }

        self.provider
            .complete(CompletionRequest {
                model: self.model.clone(),
                prompt: prompts::revision_prompt(content, instructions),
                max_tokens: 8000,
                temperature: Some(1.0),
            })
            .await
    }

    #[instrument(skip_all)]
    pub async fn improve_topic(&self, topic: &str) -> Result<String> {
        if topic.trim().is_empty() {
            return Err(AppError::Configuration("El prompt es requerido".to_string()));
        }

        self.provider
            .complete(CompletionRequest {
                model: self.model.clone(),
                prompt: prompts::topic_improvement_prompt(topic),
                max_tokens: 2000,
                temperature: Some(1.0),
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::testing::FakeProvider;

    #[tokio::test]
    async fn test_revise_requires_instructions() {
        let provider = Arc::new(FakeProvider::new());
        let client = RevisionClient::new(provider.clone(), "modelo");
        assert!(matches!(
            client.revise("texto", "  ").await,
            Err(AppError::Configuration(_))
        ));
        assert!(matches!(
            client.revise("", "más corto").await,
            Err(AppError::Configuration(_))
        ));
        assert!(provider.prompts().is_empty());
    }

    #[tokio::test]
    async fn test_revise_returns_replacement() {
        let provider = Arc::new(FakeProvider::new());
        provider.push_completion("Texto mejorado.");
        let client = RevisionClient::new(provider.clone(), "modelo");
        let revised = client.revise("Texto original.", "Hazlo mejor").await.unwrap();
        assert_eq!(revised, "Texto mejorado.");
        let prompt = &provider.prompts()[0];
        assert!(prompt.contains("Texto original."));
        assert!(prompt.contains("Hazlo mejor"));
    }

    #[tokio::test]
    async fn test_provider_failure_propagates() {
        let provider = Arc::new(FakeProvider::new());
        provider.push_completion_error(AppError::Provider("status 529".into()));
        let client = RevisionClient::new(provider, "modelo");
        let err = client.revise("Texto", "Hazlo mejor").await.unwrap_err();
        assert_eq!(err.to_string(), "provider error: status 529");
    }

    #[tokio::test]
    async fn test_improve_topic() {
        let provider = Arc::new(FakeProvider::new());
        provider.push_completion("Una premisa rica en detalles.");
        let client = RevisionClient::new(provider.clone(), "modelo");
        let improved = client.improve_topic("un faro").await.unwrap();
        assert_eq!(improved, "Una premisa rica en detalles.");
        assert!(client.improve_topic("").await.is_err());
    }
}
