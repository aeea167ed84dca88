use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{Embedder, EmbeddingError};

#[derive(Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

/// Ollama local embedding provider, speaking the batched `/api/embed`
/// endpoint. Local models return unnormalized vectors, so every vector is
/// L2-normalized here to keep cosine comparisons on the same scale as the
/// hosted providers.
pub struct OllamaEmbedder {
    client: reqwest::Client,
    base_url: String,
    model: String,
    dimension: usize,
}

impl OllamaEmbedder {
    pub fn new(base_url: String, model: String, dimension: usize, timeout_ms: u64) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_millis(timeout_ms))
                .build()
                .unwrap_or_default(),
            base_url,
            model,
            dimension,
        }
    }

    fn normalize(vector: &mut [f32]) {
        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for value in vector.iter_mut() {
                *value /= norm;
            }
        }
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let request = EmbedRequest {
            model: &self.model,
            input: texts,
        };

        let response = self
            .client
            .post(format!("{}/api/embed", self.base_url))
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(EmbeddingError::Provider {
                status: status.as_u16(),
                message: message.trim().to_string(),
            });
        }

        let parsed: EmbedResponse = response.json().await?;
        if parsed.embeddings.len() != texts.len() {
            return Err(EmbeddingError::EmptyResponse);
        }

        let mut embeddings = parsed.embeddings;
        for embedding in &mut embeddings {
            if embedding.is_empty() {
                return Err(EmbeddingError::EmptyResponse);
            }
            Self::normalize(embedding);
        }
        Ok(embeddings)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}
