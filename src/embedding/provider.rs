use async_trait::async_trait;

use crate::config::{Config, EmbeddingProviderType};
use crate::error::Error;

use super::mock::MockProvider;
use super::ollama::OllamaProvider;
use super::openai::OpenAIProvider;

/// Trait for embedding text into vector representations.
///
/// Implementations must be idempotent per text: the same input always yields
/// the same vector.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a batch of texts, returning one vector per input.
    async fn embed_batch(&self, texts: &[String]) -> crate::Result<Vec<Vec<f32>>>;

    /// The dimensionality of the embedding vectors produced.
    fn dimensions(&self) -> usize;

    /// Human-readable name for this provider.
    fn name(&self) -> &str;
}

/// Create an embedding provider based on the current configuration.
pub fn create_provider(config: &Config) -> crate::Result<Box<dyn EmbeddingProvider>> {
    match config.embedding_provider {
        EmbeddingProviderType::OpenAI => {
            let api_key = config.openai_api_key.as_ref().ok_or_else(|| {
                Error::Init("OpenAI provider requires OPENAI_API_KEY to be set".into())
            })?;
            Ok(Box::new(OpenAIProvider::new(
                api_key.clone(),
                config.embedding_model.clone(),
                config.embedding_dimensions,
                config.embedding_endpoint.clone(),
            )))
        }
        EmbeddingProviderType::Ollama => Ok(Box::new(OllamaProvider::new(
            config.ollama_host.clone(),
            config.embedding_model.clone(),
            config.embedding_dimensions,
        ))),
        EmbeddingProviderType::Custom => {
            let endpoint = config.embedding_endpoint.as_ref().ok_or_else(|| {
                Error::Init("custom provider requires RAGFORGE_EMBEDDING_ENDPOINT to be set".into())
            })?;
            Ok(Box::new(OpenAIProvider::new(
                config.openai_api_key.clone().unwrap_or_default(),
                config.embedding_model.clone(),
                config.embedding_dimensions,
                Some(endpoint.clone()),
            )))
        }
        EmbeddingProviderType::Mock => {
            Ok(Box::new(MockProvider::new(config.embedding_dimensions)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        let mut config = Config::for_tests(std::path::Path::new("/tmp/ragforge-test"));
        config.embedding_provider = EmbeddingProviderType::OpenAI;
        config.openai_api_key = Some("sk-test-key".into());
        config.embedding_dimensions = 1536;
        config
    }

    #[test]
    fn create_provider_openai() {
        let provider = create_provider(&base_config()).unwrap();
        assert_eq!(provider.name(), "openai");
        assert_eq!(provider.dimensions(), 1536);
    }

    #[test]
    fn create_provider_ollama() {
        let mut config = base_config();
        config.embedding_provider = EmbeddingProviderType::Ollama;
        let provider = create_provider(&config).unwrap();
        assert_eq!(provider.name(), "ollama");
    }

    #[test]
    fn create_provider_mock() {
        let mut config = base_config();
        config.embedding_provider = EmbeddingProviderType::Mock;
        let provider = create_provider(&config).unwrap();
        assert_eq!(provider.name(), "mock");
    }

    #[test]
    fn missing_key_is_init_error() {
        let mut config = base_config();
        config.openai_api_key = None;
        let err = match create_provider(&config) {
            Err(e) => e,
            Ok(_) => panic!("expected error for missing API key"),
        };
        assert!(matches!(err, Error::Init(_)));
        assert!(err.to_string().contains("OPENAI_API_KEY"));
    }

    #[test]
    fn custom_requires_endpoint() {
        let mut config = base_config();
        config.embedding_provider = EmbeddingProviderType::Custom;
        config.embedding_endpoint = None;
        assert!(create_provider(&config).is_err());
    }
}
