use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use std::{env, path::PathBuf};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Read-only source of configuration values.
#[async_trait::async_trait]
#[typetag::serde]
pub trait ConfigManagerType: Send + Sync {
    async fn get(&self, key: &str) -> Option<String>;
    fn clone_box(&self) -> Box<dyn ConfigManagerType>;
    fn debug_box(&self) -> String;
}

#[derive(Serialize, Deserialize)]
pub struct ConfigManager(pub Box<dyn ConfigManagerType>);

impl ConfigManager {
    pub async fn get(&self, key: &str) -> Option<String> {
        self.0.get(key).await
    }
}

impl Clone for ConfigManager {
    fn clone(&self) -> Self {
        ConfigManager(self.0.clone_box())
    }
}

impl std::fmt::Debug for ConfigManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.debug_box())
    }
}

/// Process environment, seeded once from an optional `.env` file.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EnvConfigManager {
    env_file: PathBuf,
}

impl EnvConfigManager {
    pub fn new(env_file: PathBuf) -> Box<Self> {
        match dotenvy::from_path(&env_file) {
            Ok(()) => info!("Loaded .env from {}", env_file.display()),
            Err(e) if env_file.exists() => warn!("Could not parse {}: {e}", env_file.display()),
            Err(_) => debug!("No .env at {}, using the process environment", env_file.display()),
        }
        Box::new(Self { env_file })
    }
}

#[typetag::serde]
#[async_trait]
impl ConfigManagerType for EnvConfigManager {
    async fn get(&self, key: &str) -> Option<String> {
        env::var(key).ok()
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        format!("EnvConfigManager({})", self.env_file.display())
    }
}

/// Fixed key/value pairs, for tests and embedding.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MapConfigManager {
    map: DashMap<String, String>,
}

impl MapConfigManager {
    pub fn new() -> Box<Self> {
        Box::new(Self::default())
    }

    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Box<Self> {
        let map = pairs
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Box::new(Self { map })
    }
}

#[typetag::serde]
#[async_trait]
impl ConfigManagerType for MapConfigManager {
    async fn get(&self, key: &str) -> Option<String> {
        self.map.get(key).map(|v| v.clone())
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        format!("MapConfigManager({} entries)", self.map.len())
    }
}

pub const MAX_PROCESSING_TIME_MS: &str = "CHATBOT_MAX_PROCESSING_TIME_MS";
pub const CONTEXT_TTL_SECS: &str = "CHATBOT_CONTEXT_TTL_SECS";
pub const DEFAULT_CONTEXT_MESSAGES: &str = "CHATBOT_DEFAULT_CONTEXT_MESSAGES";
pub const DEFAULT_RESPONSE: &str = "CHATBOT_DEFAULT_RESPONSE";
pub const LLM_PROVIDER: &str = "CHATBOT_LLM_PROVIDER";
pub const LLM_MODEL: &str = "CHATBOT_LLM_MODEL";
pub const LLM_MAX_TOKENS: &str = "CHATBOT_LLM_MAX_TOKENS";
pub const LLM_TEMPERATURE: &str = "CHATBOT_LLM_TEMPERATURE";
pub const SYSTEM_PROMPT: &str = "CHATBOT_SYSTEM_PROMPT";
pub const OPENAI_KEY: &str = "OPENAI_KEY";
pub const OPENAI_URL: &str = "OPENAI_URL";
pub const OLLAMA_URL: &str = "OLLAMA_URL";
pub const OLLAMA_KEY: &str = "OLLAMA_KEY";

pub const DEFAULT_OPENAI_URL: &str = "https://api.openai.com/v1";

pub const DEFAULT_REPLY_TEXT: &str = "Lo siento, no entendí tu mensaje. Escribe *menu* para ver las opciones disponibles o *ayuda* para hablar con un agente.";

pub const DEFAULT_SYSTEM_PROMPT: &str = "Eres el asistente virtual de atención al cliente de una empresa en WhatsApp. Responde en español, con frases breves, amables y precisas. Si no conoces la respuesta, invita al usuario a escribir *menu*.";

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LlmProvider {
    OpenAi,
    Ollama,
    #[default]
    None,
}

impl FromStr for LlmProvider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "openai" => Ok(LlmProvider::OpenAi),
            "ollama" => Ok(LlmProvider::Ollama),
            "none" | "" => Ok(LlmProvider::None),
            other => Err(format!("unknown LLM provider `{other}`")),
        }
    }
}

impl fmt::Display for LlmProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LlmProvider::OpenAi => "openai",
            LlmProvider::Ollama => "ollama",
            LlmProvider::None => "none",
        })
    }
}

#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct LlmSettings {
    pub provider: LlmProvider,
    pub model: Option<String>,
    pub max_tokens: u32,
    pub temperature: f32,
    pub system_prompt: String,
    pub openai_key: Option<String>,
    pub openai_url: String,
    pub ollama_url: Option<String>,
    pub ollama_key: Option<String>,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            provider: LlmProvider::None,
            model: None,
            max_tokens: 256,
            temperature: 0.7,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            openai_key: None,
            openai_url: DEFAULT_OPENAI_URL.to_string(),
            ollama_url: None,
            ollama_key: None,
        }
    }
}

impl fmt::Debug for LlmSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LlmSettings")
            .field("provider", &self.provider)
            .field("model", &self.model)
            .field("max_tokens", &self.max_tokens)
            .field("temperature", &self.temperature)
            .field("openai_key", &self.openai_key.as_ref().map(|_| "***"))
            .field("openai_url", &self.openai_url)
            .field("ollama_url", &self.ollama_url)
            .field("ollama_key", &self.ollama_key.as_ref().map(|_| "***"))
            .finish()
    }
}

/// Runtime settings of the conversation engine.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Budget for a whole turn, assistant call included.
    pub max_processing_time: Duration,
    pub context_ttl: Duration,
    pub default_context_messages: usize,
    pub default_response: String,
    pub llm: LlmSettings,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_processing_time: Duration::from_millis(5000),
            context_ttl: Duration::from_secs(1800),
            default_context_messages: 10,
            default_response: DEFAULT_REPLY_TEXT.to_string(),
            llm: LlmSettings::default(),
        }
    }
}

impl EngineConfig {
    pub async fn from_config(config: &ConfigManager) -> Self {
        let defaults = EngineConfig::default();
        let llm_defaults = LlmSettings::default();

        let max_ms: u64 = parse_or(
            config,
            MAX_PROCESSING_TIME_MS,
            defaults.max_processing_time.as_millis() as u64,
        )
        .await;
        let ttl_secs: u64 = parse_or(config, CONTEXT_TTL_SECS, defaults.context_ttl.as_secs()).await;

        let llm = LlmSettings {
            provider: parse_or(config, LLM_PROVIDER, llm_defaults.provider).await,
            model: non_empty(config, LLM_MODEL).await,
            max_tokens: parse_or(config, LLM_MAX_TOKENS, llm_defaults.max_tokens).await,
            temperature: parse_or(config, LLM_TEMPERATURE, llm_defaults.temperature).await,
            system_prompt: non_empty(config, SYSTEM_PROMPT)
                .await
                .unwrap_or(llm_defaults.system_prompt),
            openai_key: non_empty(config, OPENAI_KEY).await,
            openai_url: non_empty(config, OPENAI_URL)
                .await
                .unwrap_or(llm_defaults.openai_url),
            ollama_url: non_empty(config, OLLAMA_URL).await,
            ollama_key: non_empty(config, OLLAMA_KEY).await,
        };

        Self {
            max_processing_time: Duration::from_millis(max_ms.max(1)),
            context_ttl: Duration::from_secs(ttl_secs),
            default_context_messages: parse_or(
                config,
                DEFAULT_CONTEXT_MESSAGES,
                defaults.default_context_messages,
            )
            .await,
            default_response: non_empty(config, DEFAULT_RESPONSE)
                .await
                .unwrap_or(defaults.default_response),
            llm,
        }
    }
}

async fn non_empty(config: &ConfigManager, key: &str) -> Option<String> {
    config
        .get(key)
        .await
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

async fn parse_or<T>(config: &ConfigManager, key: &str, default: T) -> T
where
    T: FromStr + fmt::Debug,
{
    match non_empty(config, key).await {
        None => default,
        Some(raw) => match raw.parse::<T>() {
            Ok(value) => value,
            Err(_) => {
                warn!("Invalid value `{raw}` for {key}, using default {default:?}");
                default
            }
        },
    }
}
