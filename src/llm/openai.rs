use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{clamp_temperature, ChatMessage, LlmError, StructuredLlm, StructuredOutput, TokenUsage};

/// OpenAI-compatible chat-completions provider in JSON mode. The requested
/// schema is passed to the model through the system prompt; the response body
/// is parsed as a single JSON object.
pub struct OpenAiStructuredLlm {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl OpenAiStructuredLlm {
    pub fn new(
        api_key: String,
        model: String,
        base_url: Option<String>,
        timeout_ms: u64,
    ) -> Self {
        let base_url = base_url.unwrap_or_else(|| "https://api.openai.com/v1".to_string());
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_millis(timeout_ms))
                .build()
                .unwrap_or_default(),
            api_key,
            model,
            base_url,
        }
    }

    /// Build from settings, falling back to `{PROVIDER}_API_KEY` env.
    pub fn from_settings(settings: &crate::config::LlmEnhancementSettings) -> Self {
        let api_key = std::env::var(format!("{}_API_KEY", settings.provider.to_uppercase()))
            .unwrap_or_default();
        Self::new(api_key, settings.model.clone(), None, settings.timeout_ms)
    }
}

#[async_trait]
impl StructuredLlm for OpenAiStructuredLlm {
    async fn generate_object(
        &self,
        schema: &serde_json::Value,
        messages: &[ChatMessage],
        temperature: f32,
    ) -> Result<StructuredOutput, LlmError> {
        #[derive(Serialize)]
        struct ChatRequest<'a> {
            model: &'a str,
            messages: Vec<&'a ChatMessage>,
            temperature: f32,
            response_format: ResponseFormat,
        }

        #[derive(Serialize)]
        struct ResponseFormat {
            #[serde(rename = "type")]
            format_type: &'static str,
        }

        #[derive(Deserialize)]
        struct ChatResponse {
            choices: Vec<Choice>,
            usage: Option<UsageBody>,
        }

        #[derive(Deserialize)]
        struct Choice {
            message: MessageBody,
        }

        #[derive(Deserialize)]
        struct MessageBody {
            content: Option<String>,
        }

        #[derive(Deserialize)]
        struct UsageBody {
            prompt_tokens: u32,
            completion_tokens: u32,
            total_tokens: u32,
        }

        let schema_prompt = ChatMessage::system(format!(
            "Respond with a single JSON object matching this schema, nothing else:\n{}",
            schema
        ));
        let mut all_messages: Vec<&ChatMessage> = vec![&schema_prompt];
        all_messages.extend(messages.iter());

        let request = ChatRequest {
            model: &self.model,
            messages: all_messages,
            temperature: clamp_temperature(temperature),
            response_format: ResponseFormat {
                format_type: "json_object",
            },
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(LlmError::Api {
                message: error_text,
            });
        }

        let chat_response: ChatResponse = response.json().await?;
        let content = chat_response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or(LlmError::EmptyResponse)?;

        let object: serde_json::Value = serde_json::from_str(&content)?;
        let usage = chat_response.usage.map(|u| TokenUsage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        });

        Ok(StructuredOutput { object, usage })
    }
}
