use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use tracing::error;

use super::{AssistantClient, AssistantReply, AssistantRequest};
use crate::config::LlmSettings;
use crate::error::AssistantError;

pub const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";

/// Calls an OpenAI-compatible Chat Completions endpoint.
#[derive(Debug, Clone)]
pub struct OpenAiAssistant {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl OpenAiAssistant {
    pub fn new(api_key: impl Into<String>, base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            base_url: base_url.into(),
            model: model.into(),
        }
    }

    pub fn from_settings(settings: &LlmSettings) -> Result<Self, AssistantError> {
        let api_key = settings
            .openai_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .ok_or(AssistantError::NotConfigured)?;
        Ok(Self::new(
            api_key,
            settings.openai_url.clone(),
            settings
                .model
                .clone()
                .unwrap_or_else(|| DEFAULT_OPENAI_MODEL.to_string()),
        ))
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn body(&self, request: &AssistantRequest) -> Value {
        json!({
            "model": self.model,
            "messages": request.chat_messages(),
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
            "logprobs": true,
        })
    }
}

#[async_trait]
impl AssistantClient for OpenAiAssistant {
    fn name(&self) -> &'static str {
        "openai"
    }

    #[tracing::instrument(name = "openai_assistant_complete", skip(self, request))]
    async fn complete(&self, request: &AssistantRequest) -> Result<AssistantReply, AssistantError> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let resp = self
            .client
            .post(url)
            .bearer_auth(&self.api_key)
            .timeout(request.timeout)
            .json(&self.body(request))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AssistantError::Timeout(request.timeout.as_millis() as u64)
                } else {
                    AssistantError::Request(format!("OpenAI request failed: {e}"))
                }
            })?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_else(|_| "<no body>".into());
            error!("OpenAI error: {}", text);
            return Err(AssistantError::Request(format!(
                "OpenAI API returned {status}: {text}"
            )));
        }

        let json: Value = resp
            .json()
            .await
            .map_err(|e| AssistantError::InvalidResponse(format!("Invalid OpenAI response: {e}")))?;

        parse_completion(&json)
    }
}

fn parse_completion(json: &Value) -> Result<AssistantReply, AssistantError> {
    let content = json
        .pointer("/choices/0/message/content")
        .cloned()
        .ok_or_else(|| {
            AssistantError::InvalidResponse("OpenAI response missing message content".into())
        })?;

    let text = match content {
        Value::String(s) => s,
        Value::Array(parts) => choice_array_to_string(parts),
        other => other.to_string(),
    };

    let tokens_used = json
        .pointer("/usage/total_tokens")
        .and_then(Value::as_u64)
        .map(|t| t as u32);

    Ok(AssistantReply {
        text: text.trim().to_string(),
        tokens_used,
        confidence: mean_token_probability(json),
    })
}

/// exp(mean logprob) over the returned tokens, when logprobs were sent back.
fn mean_token_probability(json: &Value) -> Option<f64> {
    let tokens = json.pointer("/choices/0/logprobs/content")?.as_array()?;
    let logprobs: Vec<f64> = tokens
        .iter()
        .filter_map(|t| t.get("logprob").and_then(Value::as_f64))
        .collect();
    if logprobs.is_empty() {
        return None;
    }
    let mean = logprobs.iter().sum::<f64>() / logprobs.len() as f64;
    Some(mean.exp().clamp(0.0, 1.0))
}

fn choice_array_to_string(parts: Vec<Value>) -> String {
    parts
        .into_iter()
        .filter_map(|p| match p {
            Value::Object(mut obj) => obj.remove("text"),
            Value::String(s) => Some(Value::String(s)),
            _ => None,
        })
        .filter_map(|v| v.as_str().map(|s| s.to_string()))
        .collect::<Vec<_>>()
        .join("\n")
}
