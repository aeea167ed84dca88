use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;

use super::{Embedder, EmbeddingError, RequestFormat};

/// Embedding provider for any URL-based service.
///
/// OpenAI-compatible endpoints get one batched request; the `Custom` format
/// posts one request per text and digs the vector out of the response via a
/// dotted path, so odd self-hosted services plug in without adapter code.
pub struct CustomEmbedder {
    client: reqwest::Client,
    url: String,
    headers: HashMap<String, String>,
    request_format: RequestFormat,
    dimension: usize,
}

impl CustomEmbedder {
    pub fn new(
        url: String,
        headers: HashMap<String, String>,
        request_format: RequestFormat,
        dimension: usize,
        timeout_ms: u64,
    ) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_millis(timeout_ms))
                .build()
                .unwrap_or_default(),
            url,
            headers,
            request_format,
            dimension,
        }
    }

    async fn post(&self, body: &Value) -> Result<Value, EmbeddingError> {
        let mut request = self.client.post(&self.url).json(body);
        for (key, value) in &self.headers {
            request = request.header(key, value);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(EmbeddingError::Provider {
                status: status.as_u16(),
                message: message.trim().to_string(),
            });
        }
        Ok(response.json().await?)
    }
}

/// Walk a dotted path through objects and arrays: "data.0.embedding".
fn lookup_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn as_vector(value: &Value) -> Option<Vec<f32>> {
    value
        .as_array()?
        .iter()
        .map(|v| v.as_f64().map(|f| f as f32))
        .collect()
}

#[async_trait]
impl Embedder for CustomEmbedder {
    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        match &self.request_format {
            RequestFormat::OpenAiCompatible => {
                let body = json!({ "input": texts, "model": "default" });
                let response = self.post(&body).await?;

                let rows = response
                    .get("data")
                    .and_then(Value::as_array)
                    .ok_or(EmbeddingError::EmptyResponse)?;
                if rows.len() != texts.len() {
                    return Err(EmbeddingError::EmptyResponse);
                }
                rows.iter()
                    .map(|row| {
                        row.get("embedding")
                            .and_then(as_vector)
                            .ok_or(EmbeddingError::EmptyResponse)
                    })
                    .collect()
            }
            RequestFormat::Custom {
                text_field,
                response_field,
            } => {
                let mut embeddings = Vec::with_capacity(texts.len());
                for text in texts {
                    let mut body = serde_json::Map::new();
                    body.insert(text_field.clone(), Value::String(text.clone()));
                    let response = self.post(&Value::Object(body)).await?;
                    let vector = lookup_path(&response, response_field)
                        .and_then(as_vector)
                        .ok_or_else(|| EmbeddingError::Config(format!(
                            "response has no embedding at '{}'",
                            response_field
                        )))?;
                    embeddings.push(vector);
                }
                Ok(embeddings)
            }
        }
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}
