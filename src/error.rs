use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// A flow script that could not be turned into a compiled unit.
#[derive(Debug, Clone, Error, PartialEq, Serialize, Deserialize)]
#[error("line {line}: {reason}")]
pub struct CompileError {
    pub line: usize,
    pub reason: String,
}

impl CompileError {
    pub fn new(line: usize, reason: impl Into<String>) -> Self {
        Self {
            line,
            reason: reason.into(),
        }
    }
}

/// Failures reported by the flow, context and interaction stores.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StoreError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("record not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum AssistantError {
    #[error("assistant timed out after {0} ms")]
    Timeout(u64),
    #[error("assistant request failed: {0}")]
    Request(String),
    #[error("assistant returned an invalid response: {0}")]
    InvalidResponse(String),
    #[error("assistant is not configured")]
    NotConfigured,
}

/// Validation and storage failures surfaced to administrative callers.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum AdminError {
    #[error("a flow named `{0}` already exists")]
    DuplicateName(String),
    #[error("flow {0} not found")]
    NotFound(Uuid),
    #[error("invalid field `{field}`: {reason}")]
    InvalidField { field: &'static str, reason: String },
    #[error("flow {0} is the active default flow and cannot be deleted")]
    DeleteActiveDefault(Uuid),
    #[error("flow {0} is the only default flow; promote another flow first")]
    DemoteLastDefault(Uuid),
    #[error(transparent)]
    Storage(#[from] StoreError),
}

/// Why a chat turn ran with reduced functionality.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum DegradedReason {
    ContextStoreUnavailable(String),
    FlowStoreUnavailable(String),
    InteractionStoreUnavailable(String),
}

impl fmt::Display for DegradedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DegradedReason::ContextStoreUnavailable(e) => write!(f, "context store unavailable: {e}"),
            DegradedReason::FlowStoreUnavailable(e) => write!(f, "flow store unavailable: {e}"),
            DegradedReason::InteractionStoreUnavailable(e) => {
                write!(f, "interaction store unavailable: {e}")
            }
        }
    }
}
