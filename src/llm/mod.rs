mod openai;

pub use openai::OpenAiStructuredLlm;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Chat roles accepted by structured-completion providers
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// A JSON value the provider claims matches the requested schema, plus
/// whatever usage accounting it reported.
#[derive(Debug, Clone)]
pub struct StructuredOutput {
    pub object: serde_json::Value,
    pub usage: Option<TokenUsage>,
}

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("JSON parsing failed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("API error: {message}")]
    Api { message: String },
    #[error("response does not match the requested schema: {0}")]
    SchemaValidation(String),
    #[error("empty response from provider")]
    EmptyResponse,
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Chat-completion capability constrained to schema-shaped JSON output.
/// Providers clamp temperature into 0.1..=0.3.
#[async_trait]
pub trait StructuredLlm: Send + Sync {
    async fn generate_object(
        &self,
        schema: &serde_json::Value,
        messages: &[ChatMessage],
        temperature: f32,
    ) -> Result<StructuredOutput, LlmError>;
}

/// Deserialize a structured output into the expected type. Serde carries the
/// schema: a mismatch is a typed [`LlmError::SchemaValidation`], never a raw
/// string handled ad hoc.
pub fn parse_validated<T: DeserializeOwned>(output: &StructuredOutput) -> Result<T, LlmError> {
    serde_json::from_value(output.object.clone())
        .map_err(|e| LlmError::SchemaValidation(e.to_string()))
}

pub(crate) fn clamp_temperature(temperature: f32) -> f32 {
    temperature.clamp(0.1, 0.3)
}
