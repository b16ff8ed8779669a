use async_trait::async_trait;
use ollama_rs::Ollama;
use ollama_rs::generation::completion::request::GenerationRequest;
use ollama_rs::models::ModelOptions;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use url::Url;

use super::{AssistantClient, AssistantReply, AssistantRequest};
use crate::config::LlmSettings;
use crate::error::AssistantError;

pub const DEFAULT_OLLAMA_MODEL: &str = "llama3.2";

/// Invokes an Ollama server via `ollama_rs`.
/// OLLAMA_URL picks another server; OLLAMA_KEY adds a Bearer token.
#[derive(Debug, Clone)]
pub struct OllamaAssistant {
    client: Ollama,
    model: String,
}

impl OllamaAssistant {
    pub fn new(client: Ollama, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }

    pub fn from_settings(settings: &LlmSettings) -> Result<Self, AssistantError> {
        let client = build_client(settings.ollama_url.as_deref(), settings.ollama_key.as_deref())?;
        Ok(Self::new(
            client,
            settings
                .model
                .clone()
                .unwrap_or_else(|| DEFAULT_OLLAMA_MODEL.to_string()),
        ))
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

fn build_client(url: Option<&str>, key: Option<&str>) -> Result<Ollama, AssistantError> {
    let Some(raw) = url else {
        return Ok(Ollama::default());
    };
    let url = Url::parse(raw)
        .map_err(|e| AssistantError::Request(format!("invalid OLLAMA_URL `{raw}`: {e}")))?;
    // without an explicit port ollama-rs would guess wrong, use its default
    let Some(port) = url.port() else {
        return Ok(Ollama::default());
    };

    let mut headers = HeaderMap::new();
    if let Some(key) = key {
        if let Ok(value) = HeaderValue::from_str(&format!("Bearer {key}")) {
            headers.insert(AUTHORIZATION, value);
        }
    }
    if headers.is_empty() {
        return Ok(Ollama::new(url, port));
    }

    let client = reqwest::Client::builder()
        .default_headers(headers)
        .build()
        .map_err(|e| AssistantError::Request(format!("reqwest client: {e}")))?;
    Ok(Ollama::new_with_client(url, port, client))
}

#[async_trait]
impl AssistantClient for OllamaAssistant {
    fn name(&self) -> &'static str {
        "ollama"
    }

    #[tracing::instrument(name = "ollama_assistant_complete", skip(self, request))]
    async fn complete(&self, request: &AssistantRequest) -> Result<AssistantReply, AssistantError> {
        let options = ModelOptions::default()
            .temperature(request.temperature)
            .num_predict(request.max_tokens as i32);
        let req = GenerationRequest::new(self.model.clone(), request.render_prompt())
            .system(request.system_prompt.clone())
            .options(options);

        let resp = self
            .client
            .generate(req)
            .await
            .map_err(|e| AssistantError::Request(format!("Generate error: {e}")))?;

        Ok(AssistantReply {
            text: resp.response.trim().to_string(),
            tokens_used: None,
            confidence: None,
        })
    }
}
