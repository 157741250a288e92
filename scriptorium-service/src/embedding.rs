//! Embedding provider client (Ollama-compatible API).

use futures::future::BoxFuture;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::EmbeddingConfig;
use crate::error::{EmbeddingError, ServiceResult};

/// Seam between the pipeline and whatever produces vectors.
///
/// `Ok(None)` means the provider produced no embedding for the input, which
/// callers treat as a retryable per-item failure, distinct from a transport
/// or provider error.
pub trait EmbeddingProvider: Send + Sync {
    fn generate_embedding<'a>(
        &'a self,
        text: &'a str,
    ) -> BoxFuture<'a, ServiceResult<Option<Vec<f32>>>>;
}

/// Client for an Ollama-compatible embeddings endpoint.
pub struct OllamaClient {
    client: Client,
    base_url: String,
    model: String,
}

impl OllamaClient {
    pub fn new(config: &EmbeddingConfig) -> ServiceResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| EmbeddingError::Connection {
                url: config.base_url.clone(),
                source: e,
            })?;

        Ok(Self {
            client,
            base_url: config.base_url.clone(),
            model: config.model.clone(),
        })
    }

    /// Check if the embedding provider is reachable.
    pub async fn health_check(&self) -> bool {
        let url = format!("{}/api/tags", self.base_url);

        match self.client.get(&url).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                warn!(error = %e, "embedding provider health check failed");
                false
            }
        }
    }

    async fn embed(&self, text: &str) -> ServiceResult<Option<Vec<f32>>> {
        let url = format!("{}/api/embeddings", self.base_url);

        let request = OllamaEmbeddingRequest {
            model: self.model.clone(),
            prompt: text.to_string(),
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| EmbeddingError::Connection {
                url: url.clone(),
                source: e,
            })?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();

            if status == 429 {
                return Err(EmbeddingError::RateLimited { status, message }.into());
            }

            if message.contains("model")
                && (message.contains("not found") || message.contains("does not exist"))
            {
                return Err(EmbeddingError::ModelNotFound {
                    model: self.model.clone(),
                }
                .into());
            }

            return Err(EmbeddingError::Generation { status, message }.into());
        }

        let embedding_response: OllamaEmbeddingResponse =
            response
                .json()
                .await
                .map_err(|e| EmbeddingError::InvalidResponse {
                    message: e.to_string(),
                })?;

        if embedding_response.embedding.is_empty() {
            debug!(model = %self.model, "provider returned an empty embedding");
            return Ok(None);
        }

        Ok(Some(embedding_response.embedding))
    }
}

impl EmbeddingProvider for OllamaClient {
    fn generate_embedding<'a>(
        &'a self,
        text: &'a str,
    ) -> BoxFuture<'a, ServiceResult<Option<Vec<f32>>>> {
        Box::pin(self.embed(text))
    }
}

#[derive(Debug, Serialize)]
struct OllamaEmbeddingRequest {
    model: String,
    prompt: String,
}

#[derive(Debug, Deserialize)]
struct OllamaEmbeddingResponse {
    #[serde(default)]
    embedding: Vec<f32>,
}
