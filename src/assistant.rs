//! External language-model assistant used as a fallback.

pub mod ollama;
pub mod openai;

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::config::{LlmProvider, LlmSettings};
use crate::error::AssistantError;
use crate::state::{VariableBag, bag_to_json};

pub use ollama::OllamaAssistant;
pub use openai::OpenAiAssistant;

pub type Assistant = Arc<dyn AssistantClient>;

/// One exchange from the conversation memory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryTurn {
    pub user: String,
    pub assistant: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AssistantRequest {
    pub system_prompt: String,
    pub prompt: String,
    pub history: Vec<HistoryTurn>,
    pub variables: VariableBag,
    pub max_tokens: u32,
    pub temperature: f32,
    /// Hard upper bound for the whole call.
    pub timeout: Duration,
}

impl AssistantRequest {
    /// Single-string rendering for completion style backends.
    pub fn render_prompt(&self) -> String {
        let mut out = String::new();
        if !self.variables.is_empty() {
            out.push_str(&format!(
                "Datos conocidos del usuario: {}\n\n",
                bag_to_json(&self.variables)
            ));
        }
        for turn in &self.history {
            out.push_str(&format!("Usuario: {}\nAsistente: {}\n", turn.user, turn.assistant));
        }
        out.push_str(&format!("Usuario: {}\nAsistente:", self.prompt));
        out
    }

    /// Chat-style message list: system, memory, then the new message.
    pub fn chat_messages(&self) -> Vec<serde_json::Value> {
        let mut system = self.system_prompt.clone();
        if !self.variables.is_empty() {
            system.push_str(&format!(
                "\n\nDatos conocidos del usuario: {}",
                bag_to_json(&self.variables)
            ));
        }
        let mut messages = vec![json!({"role": "system", "content": system})];
        for turn in &self.history {
            messages.push(json!({"role": "user", "content": turn.user}));
            messages.push(json!({"role": "assistant", "content": turn.assistant}));
        }
        messages.push(json!({"role": "user", "content": self.prompt}));
        messages
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AssistantReply {
    pub text: String,
    pub tokens_used: Option<u32>,
    /// Backend-provided confidence in 0..=1, when it has one.
    pub confidence: Option<f64>,
}

#[async_trait]
pub trait AssistantClient: Send + Sync + Debug {
    fn name(&self) -> &'static str;

    async fn complete(&self, request: &AssistantRequest) -> Result<AssistantReply, AssistantError>;
}

/// Run `complete` under `request.timeout`. The future is dropped when the
/// budget runs out, so the caller never waits longer than that.
pub async fn complete_within(
    client: &dyn AssistantClient,
    request: &AssistantRequest,
) -> Result<AssistantReply, AssistantError> {
    match tokio::time::timeout(request.timeout, client.complete(request)).await {
        Ok(result) => {
            let reply = result?;
            if reply.text.trim().is_empty() {
                return Err(AssistantError::InvalidResponse("empty completion".into()));
            }
            Ok(reply)
        }
        Err(_) => Err(AssistantError::Timeout(request.timeout.as_millis() as u64)),
    }
}

/// Build the configured assistant, or `None` when the provider is `none` or
/// its settings are incomplete.
pub fn from_settings(settings: &LlmSettings) -> Option<Assistant> {
    match settings.provider {
        LlmProvider::None => {
            info!("No LLM provider configured, assistant fallback disabled");
            None
        }
        LlmProvider::OpenAi => match OpenAiAssistant::from_settings(settings) {
            Ok(client) => {
                info!("🤖 OpenAI assistant enabled ({})", client.model());
                Some(Arc::new(client))
            }
            Err(e) => {
                warn!("OpenAI assistant disabled: {e}");
                None
            }
        },
        LlmProvider::Ollama => match OllamaAssistant::from_settings(settings) {
            Ok(client) => {
                info!("🤖 Ollama assistant enabled ({})", client.model());
                Some(Arc::new(client))
            }
            Err(e) => {
                warn!("Ollama assistant disabled: {e}");
                None
            }
        },
    }
}
