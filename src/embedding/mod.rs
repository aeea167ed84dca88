mod custom;
mod ollama;
mod openai;
mod service;

pub use custom::CustomEmbedder;
pub use ollama::OllamaEmbedder;
pub use openai::OpenAiEmbedder;
pub use service::EmbeddingService;

use async_trait::async_trait;
use std::sync::Arc;

use crate::config::EmbeddingSettings;

/// Request shape for arbitrary embedding endpoints
#[derive(Debug, Clone)]
pub enum RequestFormat {
    OpenAiCompatible,
    /// One request per text: `text_field` names the request key, and
    /// `response_field` is a dotted path into the response body
    /// ("embedding", "data.0.embedding", ...).
    Custom {
        text_field: String,
        response_field: String,
    },
}

/// Deterministic text -> vector capability
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError>;

    async fn embed_text(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let results = self.embed_texts(&[text.to_string()]).await?;
        results.into_iter().next().ok_or(EmbeddingError::EmptyResponse)
    }

    fn dimension(&self) -> usize;
}

#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("JSON parsing failed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("provider returned HTTP {status}: {message}")]
    Provider { status: u16, message: String },
    #[error("empty response from embedding provider")]
    EmptyResponse,
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Build a provider from settings. An explicit api_key wins; otherwise the
/// `{PROVIDER}_API_KEY` environment variable is the last-resort fallback.
pub fn create_embedder(settings: &EmbeddingSettings) -> Result<Arc<dyn Embedder>, EmbeddingError> {
    let api_key = settings.api_key.clone().or_else(|| {
        std::env::var(format!("{}_API_KEY", settings.provider.to_uppercase())).ok()
    });
    match settings.provider.as_str() {
        "openai" => Ok(Arc::new(OpenAiEmbedder::new(
            api_key.unwrap_or_default(),
            settings.model.clone(),
            settings.base_url.clone(),
            settings.dimension,
            settings.timeout_ms,
        ))),
        "ollama" => Ok(Arc::new(OllamaEmbedder::new(
            settings
                .base_url
                .clone()
                .unwrap_or_else(|| "http://localhost:11434".to_string()),
            settings.model.clone(),
            settings.dimension,
            settings.timeout_ms,
        ))),
        "custom" => {
            let url = settings.base_url.clone().ok_or_else(|| {
                EmbeddingError::Config("custom provider requires a base_url".to_string())
            })?;
            Ok(Arc::new(CustomEmbedder::new(
                url,
                Default::default(),
                RequestFormat::OpenAiCompatible,
                settings.dimension,
                settings.timeout_ms,
            )))
        }
        other => Err(EmbeddingError::Config(format!(
            "unknown embedding provider: {}",
            other
        ))),
    }
}

/// Cosine similarity; 0.0 when dimensions differ or either norm is zero.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot_product / (norm_a * norm_b)
    }
}
