use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Error;

use super::provider::EmbeddingProvider;

const DEFAULT_ENDPOINT: &str = "https://api.openai.com/v1/embeddings";

/// OpenAI-compatible embedding provider. A custom `endpoint` points the same
/// request shape at any compatible server.
pub struct OpenAIProvider {
    client: reqwest::Client,
    api_key: String,
    model: String,
    dimensions: usize,
    endpoint: String,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
    dimensions: usize,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    index: usize,
    embedding: Vec<f32>,
}

impl OpenAIProvider {
    pub fn new(
        api_key: String,
        model: String,
        dimensions: usize,
        endpoint: Option<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            model,
            dimensions,
            endpoint: endpoint.unwrap_or_else(|| DEFAULT_ENDPOINT.to_string()),
        }
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAIProvider {
    async fn embed_batch(&self, texts: &[String]) -> crate::Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let request = EmbeddingRequest {
            model: &self.model,
            input: texts,
            dimensions: self.dimensions,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::EmbeddingProvider(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::EmbeddingProvider(format!(
                "embedding request returned {status}: {body}"
            )));
        }

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| Error::EmbeddingProvider(format!("invalid response body: {e}")))?;

        if parsed.data.len() != texts.len() {
            return Err(Error::EmbeddingProvider(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                parsed.data.len()
            )));
        }

        // The API may return data out of order; index is authoritative.
        let mut vectors: Vec<Vec<f32>> = vec![Vec::new(); texts.len()];
        for datum in parsed.data {
            if datum.index >= vectors.len() {
                return Err(Error::EmbeddingProvider(format!(
                    "embedding index {} out of range",
                    datum.index
                )));
            }
            vectors[datum.index] = datum.embedding;
        }
        Ok(vectors)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn name(&self) -> &str {
        "openai"
    }
}
