// src/flow.rs

pub mod loader;
pub mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use store::{FlowStore, FlowStoreType, InMemoryFlowStore};

pub const DEFAULT_PRIORITY: i32 = 10;
pub const DEFAULT_MAX_CONTEXT_MESSAGES: usize = 10;

fn default_true() -> bool {
    true
}

fn default_priority() -> i32 {
    DEFAULT_PRIORITY
}

fn default_max_context_messages() -> usize {
    DEFAULT_MAX_CONTEXT_MESSAGES
}

/// A stored, independently authored script plus its activation metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Flow {
    pub id: Uuid,
    pub name: String,
    /// Script body, opaque to everything but the dialogue interpreter.
    pub script: String,
    pub is_active: bool,
    pub is_default: bool,
    /// Lower values are matched first.
    pub priority: i32,
    pub fallback_to_llm: bool,
    pub max_context_messages: usize,
    pub usage_count: u64,
    pub last_used: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Flow {
    pub fn from_draft(draft: FlowDraft) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: draft.name,
            script: draft.script,
            is_active: draft.is_active,
            is_default: draft.is_default,
            priority: draft.priority,
            fallback_to_llm: draft.fallback_to_llm,
            max_context_messages: draft.max_context_messages,
            usage_count: 0,
            last_used: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_active_default(&self) -> bool {
        self.is_active && self.is_default
    }
}

/// Fields required to create a flow. Also the on-disk shape of a flow file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FlowDraft {
    pub name: String,
    pub script: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default = "default_priority")]
    pub priority: i32,
    #[serde(default)]
    pub fallback_to_llm: bool,
    #[serde(default = "default_max_context_messages")]
    pub max_context_messages: usize,
}

impl FlowDraft {
    pub fn new(name: impl Into<String>, script: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            script: script.into(),
            is_active: true,
            is_default: false,
            priority: DEFAULT_PRIORITY,
            fallback_to_llm: false,
            max_context_messages: DEFAULT_MAX_CONTEXT_MESSAGES,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn as_default(mut self) -> Self {
        self.is_default = true;
        self
    }

    pub fn inactive(mut self) -> Self {
        self.is_active = false;
        self
    }

    pub fn with_fallback_to_llm(mut self, enabled: bool) -> Self {
        self.fallback_to_llm = enabled;
        self
    }

    pub fn with_max_context_messages(mut self, max: usize) -> Self {
        self.max_context_messages = max;
        self
    }

    /// Turn the draft into a patch that overwrites every editable field.
    pub fn into_patch(self) -> FlowPatch {
        FlowPatch {
            name: Some(self.name),
            script: Some(self.script),
            is_active: Some(self.is_active),
            is_default: Some(self.is_default),
            priority: Some(self.priority),
            fallback_to_llm: Some(self.fallback_to_llm),
            max_context_messages: Some(self.max_context_messages),
        }
    }
}

/// Partial update. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FlowPatch {
    pub name: Option<String>,
    pub script: Option<String>,
    pub is_active: Option<bool>,
    pub is_default: Option<bool>,
    pub priority: Option<i32>,
    pub fallback_to_llm: Option<bool>,
    pub max_context_messages: Option<usize>,
}

impl FlowPatch {
    pub fn is_empty(&self) -> bool {
        self == &FlowPatch::default()
    }

    pub fn apply(&self, flow: &mut Flow) {
        if let Some(name) = &self.name {
            flow.name = name.clone();
        }
        if let Some(script) = &self.script {
            flow.script = script.clone();
        }
        if let Some(active) = self.is_active {
            flow.is_active = active;
        }
        if let Some(default) = self.is_default {
            flow.is_default = default;
        }
        if let Some(priority) = self.priority {
            flow.priority = priority;
        }
        if let Some(fallback) = self.fallback_to_llm {
            flow.fallback_to_llm = fallback;
        }
        if let Some(max) = self.max_context_messages {
            flow.max_context_messages = max;
        }
        flow.updated_at = Utc::now();
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FlowUsage {
    pub flow_id: Uuid,
    pub name: String,
    pub usage_count: u64,
    pub last_used: Option<DateTime<Utc>>,
}

impl From<&Flow> for FlowUsage {
    fn from(flow: &Flow) -> Self {
        Self {
            flow_id: flow.id,
            name: flow.name.clone(),
            usage_count: flow.usage_count,
            last_used: flow.last_used,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FlowStatistics {
    pub total: usize,
    pub active: usize,
    pub default_flow_id: Option<Uuid>,
    pub per_flow: Vec<FlowUsage>,
}
