//! Per-phone-number conversation state.

use std::collections::VecDeque;
use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::error::StoreError;
use crate::state::VariableBag;

/// One processed turn. `variables` holds only what the turn changed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContextTurn {
    pub message_in: String,
    pub message_out: String,
    pub variables: VariableBag,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConversationContext {
    pub phone_number: String,
    pub turns: VecDeque<ContextTurn>,
    /// Derived from `turns`, older turns first, newer values win.
    pub variables: VariableBag,
    pub current_topic: Option<String>,
    pub last_flow_id: Option<Uuid>,
    pub session_count: u32,
    pub last_interaction: Option<DateTime<Utc>>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ConversationContext {
    pub fn new(phone_number: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            phone_number: phone_number.into(),
            turns: VecDeque::new(),
            variables: VariableBag::new(),
            current_topic: None,
            last_flow_id: None,
            session_count: 1,
            last_interaction: None,
            active: true,
            created_at: now,
            updated_at: now,
        }
    }

    /// Closed conversations and ones idle longer than `ttl` are stale.
    pub fn is_stale(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        if !self.active {
            return true;
        }
        self.last_interaction
            .map(|last| now - last > ttl)
            .unwrap_or(false)
    }

    pub fn start_new_session(&mut self, now: DateTime<Utc>) {
        self.turns.clear();
        self.variables.clear();
        self.current_topic = None;
        self.last_flow_id = None;
        self.session_count += 1;
        self.active = true;
        self.updated_at = now;
    }

    /// Keep at most `window` turns and rebuild the variable bag from them.
    pub fn trim_to(&mut self, window: usize) {
        while self.turns.len() > window {
            self.turns.pop_front();
        }
        self.rebuild_variables();
    }

    pub fn rebuild_variables(&mut self) {
        let mut bag = VariableBag::new();
        for turn in &self.turns {
            for (k, v) in &turn.variables {
                bag.insert(k.clone(), v.clone());
            }
        }
        self.variables = bag;
    }

    pub fn push_turn(&mut self, turn: ContextTurn, window: usize) {
        let at = turn.at;
        self.turns.push_back(turn);
        self.trim_to(window);
        self.last_interaction = Some(at);
        self.updated_at = at;
    }
}

pub type ContextStore = Arc<dyn ContextStoreType>;

#[async_trait]
pub trait ContextStoreType: Send + Sync + Debug {
    async fn get_or_create_context(&self, phone_number: &str)
    -> Result<ConversationContext, StoreError>;
    async fn get_context(&self, phone_number: &str)
    -> Result<Option<ConversationContext>, StoreError>;
    async fn save_context(&self, context: &ConversationContext) -> Result<(), StoreError>;
    async fn delete_context(&self, phone_number: &str) -> Result<bool, StoreError>;
    /// Mark the conversation finished; the next message starts a new session.
    async fn close_conversation(&self, phone_number: &str) -> Result<bool, StoreError>;
}

#[derive(Debug)]
pub struct InMemoryContextStore {
    contexts: DashMap<String, ConversationContext>,
    available: AtomicBool,
}

impl InMemoryContextStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            contexts: DashMap::new(),
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
            Err(StoreError::Unavailable("context store offline".into()))
        }
    }
}

#[async_trait]
impl ContextStoreType for InMemoryContextStore {
    async fn get_or_create_context(
        &self,
        phone_number: &str,
    ) -> Result<ConversationContext, StoreError> {
        self.check()?;
        let entry = self
            .contexts
            .entry(phone_number.to_string())
            .or_insert_with(|| {
                info!(phone_number, "new conversation context");
                ConversationContext::new(phone_number)
            });
        Ok(entry.value().clone())
    }

    async fn get_context(
        &self,
        phone_number: &str,
    ) -> Result<Option<ConversationContext>, StoreError> {
        self.check()?;
        Ok(self.contexts.get(phone_number).map(|c| c.value().clone()))
    }

    async fn save_context(&self, context: &ConversationContext) -> Result<(), StoreError> {
        self.check()?;
        self.contexts
            .insert(context.phone_number.clone(), context.clone());
        Ok(())
    }

    async fn delete_context(&self, phone_number: &str) -> Result<bool, StoreError> {
        self.check()?;
        Ok(self.contexts.remove(phone_number).is_some())
    }

    async fn close_conversation(&self, phone_number: &str) -> Result<bool, StoreError> {
        self.check()?;
        match self.contexts.get_mut(phone_number) {
            Some(mut ctx) => {
                ctx.active = false;
                ctx.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::StateValue;

    fn turn(n: usize, var: Option<(&str, &str)>) -> ContextTurn {
        let mut variables = VariableBag::new();
        if let Some((k, v)) = var {
            variables.insert(k.into(), StateValue::from(v));
        }
        ContextTurn {
            message_in: format!("in {n}"),
            message_out: format!("out {n}"),
            variables,
            at: Utc::now(),
        }
    }

    #[test]
    fn test_window_drops_oldest_turn_variables() {
        let mut ctx = ConversationContext::new("34600000000");
        ctx.push_turn(turn(1, Some(("name", "Ana"))), 2);
        ctx.push_turn(turn(2, Some(("city", "Madrid"))), 2);
        assert_eq!(ctx.variables.len(), 2);

        ctx.push_turn(turn(3, None), 2);
        assert_eq!(ctx.turns.len(), 2);
        assert!(!ctx.variables.contains_key("name"));
        assert!(ctx.variables.contains_key("city"));
    }

    #[test]
    fn test_newer_turn_overrides_variable() {
        let mut ctx = ConversationContext::new("1");
        ctx.push_turn(turn(1, Some(("name", "Ana"))), 5);
        ctx.push_turn(turn(2, Some(("name", "Eva"))), 5);
        assert_eq!(ctx.variables["name"], StateValue::from("Eva"));
    }

    #[test]
    fn test_staleness_and_new_session() {
        let mut ctx = ConversationContext::new("1");
        let now = Utc::now();
        ctx.push_turn(turn(1, Some(("a", "b"))), 5);
        ctx.current_topic = Some("ventas".into());
        assert!(!ctx.is_stale(Duration::seconds(60), now));
        assert!(ctx.is_stale(Duration::seconds(60), now + Duration::seconds(120)));

        ctx.start_new_session(now);
        assert_eq!(ctx.session_count, 2);
        assert!(ctx.turns.is_empty());
        assert!(ctx.variables.is_empty());
        assert_eq!(ctx.current_topic, None);
    }

    #[tokio::test]
    async fn test_close_conversation_marks_stale() {
        let store = InMemoryContextStore::new();
        store.get_or_create_context("1").await.unwrap();
        assert!(store.close_conversation("1").await.unwrap());
        let ctx = store.get_context("1").await.unwrap().unwrap();
        assert!(ctx.is_stale(Duration::hours(1), Utc::now()));
        assert!(!store.close_conversation("2").await.unwrap());
    }

    #[tokio::test]
    async fn test_unavailable_store() {
        let store = InMemoryContextStore::new();
        store.set_available(false);
        assert!(store.get_or_create_context("1").await.is_err());
    }
}
