use std::fmt::{self, Debug};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::StoreError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ResponseType {
    Flow,
    FallbackLlm,
    Default,
    /// Storage was unavailable; the reply came from in-memory defaults.
    Simulation,
}

impl ResponseType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseType::Flow => "flow",
            ResponseType::FallbackLlm => "fallback_llm",
            ResponseType::Default => "default",
            ResponseType::Simulation => "simulation",
        }
    }
}

impl fmt::Display for ResponseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Written once per processed message, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Interaction {
    pub id: Uuid,
    pub phone_number: String,
    pub message_in: String,
    pub message_out: String,
    pub response_type: ResponseType,
    pub processing_time_ms: u64,
    pub flow_id: Option<Uuid>,
    pub confidence_score: f64,
    pub tokens_used: Option<u32>,
    pub created_at: DateTime<Utc>,
}

pub type InteractionStore = Arc<dyn InteractionStoreType>;

#[async_trait]
pub trait InteractionStoreType: Send + Sync + Debug {
    async fn record(&self, interaction: Interaction) -> Result<(), StoreError>;
    async fn count_total(&self) -> Result<usize, StoreError>;
    /// Interactions created since midnight UTC.
    async fn count_today(&self) -> Result<usize, StoreError>;
    /// Newest first.
    async fn get_recent(&self, phone_number: &str, limit: usize)
    -> Result<Vec<Interaction>, StoreError>;
}

#[derive(Debug)]
pub struct InMemoryInteractionStore {
    log: RwLock<Vec<Interaction>>,
    available: AtomicBool,
}

impl InMemoryInteractionStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            log: RwLock::new(Vec::new()),
            available: AtomicBool::new(true),
        })
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("interaction store offline".into()))
        }
    }
}

#[async_trait]
impl InteractionStoreType for InMemoryInteractionStore {
    async fn record(&self, interaction: Interaction) -> Result<(), StoreError> {
        self.check()?;
        self.log.write().await.push(interaction);
        Ok(())
    }

    async fn count_total(&self) -> Result<usize, StoreError> {
        self.check()?;
        Ok(self.log.read().await.len())
    }

    async fn count_today(&self) -> Result<usize, StoreError> {
        self.check()?;
        let today = Utc::now().date_naive();
        Ok(self
            .log
            .read()
            .await
            .iter()
            .filter(|i| i.created_at.date_naive() == today)
            .count())
    }

    async fn get_recent(
        &self,
        phone_number: &str,
        limit: usize,
    ) -> Result<Vec<Interaction>, StoreError> {
        self.check()?;
        Ok(self
            .log
            .read()
            .await
            .iter()
            .rev()
            .filter(|i| i.phone_number == phone_number)
            .take(limit)
            .cloned()
            .collect())
    }
}
