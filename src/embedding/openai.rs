use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{Embedder, EmbeddingError};

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    input: &'a [String],
    model: &'a str,
    encoding_format: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<usize>,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingRow>,
}

#[derive(Deserialize)]
struct EmbeddingRow {
    index: usize,
    embedding: Vec<f32>,
}

#[derive(Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Deserialize)]
struct ApiErrorDetail {
    message: String,
}

/// OpenAI (and OpenAI-compatible) embedding provider.
///
/// Requests float encoding and, for models that support Matryoshka
/// truncation, pins the output dimension server-side. Rows are reassembled
/// by the index the API reports, and every vector is checked against the
/// configured dimension before it is handed to callers.
pub struct OpenAiEmbedder {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
    dimension: usize,
    truncatable: bool,
}

impl OpenAiEmbedder {
    pub fn new(
        api_key: String,
        model: String,
        base_url: Option<String>,
        dimension: usize,
        timeout_ms: u64,
    ) -> Self {
        // Only the text-embedding-3 family accepts a `dimensions` override;
        // older models reject the field.
        let truncatable = model.starts_with("text-embedding-3");
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_millis(timeout_ms))
                .build()
                .unwrap_or_default(),
            api_key,
            model,
            base_url: base_url.unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            dimension,
            truncatable,
        }
    }

    /// The error payload is structured JSON on the happy path; fall back to
    /// the raw body when a proxy returns plain text.
    fn decode_error(status: u16, body: &str) -> EmbeddingError {
        let message = serde_json::from_str::<ApiErrorBody>(body)
            .map(|b| b.error.message)
            .unwrap_or_else(|_| body.trim().to_string());
        EmbeddingError::Provider { status, message }
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let request = EmbeddingRequest {
            input: texts,
            model: &self.model,
            encoding_format: "float",
            dimensions: self.truncatable.then_some(self.dimension),
        };

        let response = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::decode_error(status.as_u16(), &body));
        }

        let parsed: EmbeddingResponse = response.json().await?;
        if parsed.data.len() != texts.len() {
            return Err(EmbeddingError::EmptyResponse);
        }

        // The API does not guarantee response order; the index field does.
        let mut rows = parsed.data;
        rows.sort_by_key(|row| row.index);
        let vectors: Vec<Vec<f32>> = rows.into_iter().map(|row| row.embedding).collect();

        for vector in &vectors {
            if vector.len() != self.dimension {
                return Err(EmbeddingError::Config(format!(
                    "model {} returned {}-dimensional vectors, configured for {}",
                    self.model,
                    vector.len(),
                    self.dimension
                )));
            }
        }
        Ok(vectors)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}
